//! Bastion store: typed in-memory resources with versioning, watches, ownership and finalizers.
//!
//! Each (namespace, kind) pair owns a table behind its own `RwLock`; the table
//! map itself is copy-on-write behind `ArcSwap`, so lookups never contend with
//! table creation. Watch fan-out happens under the table write lock which keeps
//! per-kind commit order intact for every subscriber.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use arc_swap::ArcSwap;
use bastion_core::{now_ts, Kind, ListOptions, Namespace, Phase, ResourceId, StateError, StateResult, Version};
use bastion_resources::{Resource, ResourceRegistry};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod safe;
mod watch;

pub use safe::{Reader, Writer};
pub use watch::{Event, Watch};

/// Conflict retry budget for `modify`.
pub const MODIFY_RETRIES: usize = 5;

#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Events buffered per watcher beyond its initial snapshot.
    pub watch_buffer: usize,
}

impl Default for StateOptions {
    fn default() -> Self { Self { watch_buffer: 128 } }
}

enum Filter {
    Kind(ListOptions),
    Id(String),
}

impl Filter {
    fn matches(&self, r: &Resource) -> bool {
        match self {
            Filter::Kind(opts) => opts.matches(&r.metadata.id, &r.metadata.labels),
            Filter::Id(id) => &r.metadata.id == id,
        }
    }
}

struct Subscriber {
    filter: Filter,
    tx: mpsc::Sender<Event>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Table {
    /// Logical commit counter; resource versions are drawn from it.
    commits: Version,
    items: BTreeMap<String, Resource>,
    subscribers: Vec<Subscriber>,
}

impl Table {
    fn next_version(&mut self) -> Version {
        self.commits += 1;
        self.commits
    }

    fn publish(&mut self, kind: Kind, ev: Event) {
        let Some(subject) = ev.resource() else { return };
        let subject = subject.clone();
        self.subscribers.retain(|s| {
            if !s.filter.matches(&subject) {
                return true;
            }
            match s.tx.try_send(ev.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    s.overflowed.store(true, Ordering::Release);
                    counter!("store_watch_overflow_total", 1u64, "kind" => kind.as_str());
                    warn!(kind = %kind, "watch buffer overflow; closing subscription");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

type Tables = FxHashMap<(Namespace, Kind), Arc<RwLock<Table>>>;

/// In-memory resource store.
pub struct State {
    registry: ResourceRegistry,
    tables: ArcSwap<Tables>,
    grow: Mutex<()>,
    opts: StateOptions,
}

impl State {
    pub fn new(registry: ResourceRegistry) -> Self { Self::with_options(registry, StateOptions::default()) }

    pub fn with_options(registry: ResourceRegistry, opts: StateOptions) -> Self {
        Self { registry, tables: ArcSwap::from_pointee(Tables::default()), grow: Mutex::new(()), opts }
    }

    pub fn registry(&self) -> &ResourceRegistry { &self.registry }

    fn check_kind(&self, namespace: Namespace, kind: Kind) -> StateResult<()> {
        match self.registry.get(kind) {
            None => Err(StateError::UnknownKind(kind)),
            Some(info) if info.namespace != namespace => {
                Err(StateError::Invalid(format!("kind {kind} lives in namespace {:?}, not {namespace:?}", info.namespace)))
            }
            Some(_) => Ok(()),
        }
    }

    fn table(&self, namespace: Namespace, kind: Kind) -> StateResult<Arc<RwLock<Table>>> {
        self.check_kind(namespace, kind)?;
        if let Some(t) = self.tables.load().get(&(namespace, kind)) {
            return Ok(Arc::clone(t));
        }
        let _g = self.grow.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.tables.load_full();
        if let Some(t) = current.get(&(namespace, kind)) {
            return Ok(Arc::clone(t));
        }
        let mut next = (*current).clone();
        let t = Arc::new(RwLock::new(Table::default()));
        next.insert((namespace, kind), Arc::clone(&t));
        self.tables.store(Arc::new(next));
        debug!(namespace, kind = %kind, "table created");
        Ok(t)
    }

    fn write(t: &RwLock<Table>) -> RwLockWriteGuard<'_, Table> { t.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn get(&self, id: &ResourceId) -> StateResult<Resource> {
        let t = self.table(id.namespace, id.kind)?;
        let g = t.read().unwrap_or_else(PoisonError::into_inner);
        g.items.get(&id.id).cloned().ok_or_else(|| StateError::NotFound(id.clone()))
    }

    /// Snapshot sorted by id.
    pub fn list(&self, namespace: Namespace, kind: Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> {
        let t = self.table(namespace, kind)?;
        let g = t.read().unwrap_or_else(PoisonError::into_inner);
        Ok(g.items.values().filter(|r| opts.matches(&r.metadata.id, &r.metadata.labels)).cloned().collect())
    }

    /// Creates a resource; the owner is taken from its metadata.
    pub fn create(&self, mut r: Resource) -> StateResult<Resource> {
        r.check_kind()?;
        let id = r.pointer();
        let t = self.table(id.namespace, id.kind)?;
        let mut g = Self::write(&t);
        if g.items.contains_key(&id.id) {
            return Err(StateError::AlreadyExists(id));
        }
        let ts = now_ts();
        r.metadata.version = g.next_version();
        r.metadata.phase = Phase::Running;
        r.metadata.created_ts = ts;
        r.metadata.updated_ts = ts;
        g.items.insert(id.id.clone(), r.clone());
        g.publish(id.kind, Event::Created(r.clone()));
        counter!("store_commits_total", 1u64, "kind" => id.kind.as_str());
        Ok(r)
    }

    /// Replaces spec, labels and annotations. Finalizers and phase are managed by
    /// their own operations and carried over. Identical content is not a commit.
    pub fn update(&self, expected: Version, mut r: Resource) -> StateResult<Resource> {
        r.check_kind()?;
        let id = r.pointer();
        let t = self.table(id.namespace, id.kind)?;
        let mut g = Self::write(&t);
        let cur = g.items.get(&id.id).ok_or_else(|| StateError::NotFound(id.clone()))?;
        if cur.metadata.owner != r.metadata.owner {
            return Err(StateError::OwnershipViolation { id, owner: cur.metadata.owner.clone(), actor: r.metadata.owner });
        }
        if cur.metadata.version != expected {
            counter!("store_conflicts_total", 1u64, "kind" => id.kind.as_str());
            return Err(StateError::ConflictingVersion { id, expected, current: cur.metadata.version });
        }
        if cur.metadata.is_tearing_down() {
            return Err(StateError::PhaseConflict { id, phase: cur.metadata.phase });
        }
        if cur.spec == r.spec && cur.metadata.same_content(&r.metadata) {
            return Ok(cur.clone());
        }
        let old = cur.clone();
        r.metadata.finalizers = old.metadata.finalizers.clone();
        r.metadata.phase = old.metadata.phase;
        r.metadata.created_ts = old.metadata.created_ts;
        r.metadata.updated_ts = now_ts();
        r.metadata.version = g.next_version();
        g.items.insert(id.id.clone(), r.clone());
        g.publish(id.kind, Event::Updated { old, new: r.clone() });
        counter!("store_commits_total", 1u64, "kind" => id.kind.as_str());
        Ok(r)
    }

    /// Get-or-create followed by `f` on a copy, outside any lock. Conflicts are
    /// retried; a result equal to the stored state does not bump the version.
    pub fn modify<F, E>(&self, template: Resource, mut f: F) -> Result<Resource, E>
    where
        F: FnMut(&mut Resource) -> Result<(), E>,
        E: From<StateError>,
    {
        let id = template.pointer();
        let owner = template.metadata.owner.clone();
        let mut last = None;
        for _ in 0..MODIFY_RETRIES {
            match self.get(&id) {
                Err(e) if e.is_not_found() => {
                    let mut r = template.clone();
                    f(&mut r)?;
                    r.metadata.owner = owner.clone();
                    match self.create(r) {
                        Ok(r) => return Ok(r),
                        Err(e) if e.is_already_exists() => last = Some(e),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
                Ok(cur) => {
                    if cur.metadata.owner != owner {
                        return Err(StateError::OwnershipViolation { id, owner: cur.metadata.owner, actor: owner }.into());
                    }
                    let mut r = cur.clone();
                    f(&mut r)?;
                    r.metadata.owner = owner.clone();
                    match self.update(cur.metadata.version, r) {
                        Ok(r) => return Ok(r),
                        Err(e) if e.is_conflict() => last = Some(e),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Err(last.unwrap_or(StateError::Cancelled).into())
    }

    /// Moves the resource to `TearingDown`. Returns whether it is ready for
    /// destroy, i.e. has no finalizers left.
    pub fn teardown(&self, id: &ResourceId, owner: &str) -> StateResult<bool> {
        let t = self.table(id.namespace, id.kind)?;
        let mut g = Self::write(&t);
        let cur = g.items.get(&id.id).ok_or_else(|| StateError::NotFound(id.clone()))?;
        if cur.metadata.owner != owner {
            return Err(StateError::OwnershipViolation { id: id.clone(), owner: cur.metadata.owner.clone(), actor: owner.to_string() });
        }
        if cur.metadata.is_tearing_down() {
            return Ok(cur.metadata.finalizers.is_empty());
        }
        let old = cur.clone();
        let mut r = old.clone();
        r.metadata.phase = Phase::TearingDown;
        r.metadata.updated_ts = now_ts();
        r.metadata.version = g.next_version();
        let ready = r.metadata.finalizers.is_empty();
        g.items.insert(id.id.clone(), r.clone());
        g.publish(id.kind, Event::Updated { old, new: r });
        counter!("store_commits_total", 1u64, "kind" => id.kind.as_str());
        Ok(ready)
    }

    pub fn destroy(&self, id: &ResourceId, owner: &str, expected: Option<Version>) -> StateResult<()> {
        let t = self.table(id.namespace, id.kind)?;
        let mut g = Self::write(&t);
        let cur = g.items.get(&id.id).ok_or_else(|| StateError::NotFound(id.clone()))?;
        if cur.metadata.owner != owner {
            return Err(StateError::OwnershipViolation { id: id.clone(), owner: cur.metadata.owner.clone(), actor: owner.to_string() });
        }
        if let Some(expected) = expected {
            if cur.metadata.version != expected {
                return Err(StateError::ConflictingVersion { id: id.clone(), expected, current: cur.metadata.version });
            }
        }
        if !cur.metadata.finalizers.is_empty() {
            return Err(StateError::HasFinalizers { id: id.clone(), finalizers: cur.metadata.finalizers.to_vec() });
        }
        g.next_version();
        if let Some(gone) = g.items.remove(&id.id) {
            g.publish(id.kind, Event::Destroyed(gone));
        }
        counter!("store_commits_total", 1u64, "kind" => id.kind.as_str());
        Ok(())
    }

    pub fn add_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()> {
        self.mutate_finalizers(id, |r| {
            if r.metadata.is_tearing_down() && !r.metadata.finalizers.has(name) {
                return Err(StateError::PhaseConflict { id: id.clone(), phase: r.metadata.phase });
            }
            Ok(r.metadata.finalizers.add(name))
        })
    }

    pub fn remove_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()> {
        self.mutate_finalizers(id, |r| Ok(r.metadata.finalizers.remove(name)))
    }

    fn mutate_finalizers<F>(&self, id: &ResourceId, f: F) -> StateResult<()>
    where
        F: FnOnce(&mut Resource) -> StateResult<bool>,
    {
        let t = self.table(id.namespace, id.kind)?;
        let mut g = Self::write(&t);
        let cur = g.items.get(&id.id).ok_or_else(|| StateError::NotFound(id.clone()))?;
        let old = cur.clone();
        let mut r = old.clone();
        if !f(&mut r)? {
            return Ok(());
        }
        r.metadata.version = g.next_version();
        r.metadata.updated_ts = now_ts();
        g.items.insert(id.id.clone(), r.clone());
        g.publish(id.kind, Event::Updated { old, new: r });
        counter!("store_commits_total", 1u64, "kind" => id.kind.as_str());
        Ok(())
    }

    /// Watches every resource of a kind matching `opts`.
    pub fn watch_kind(&self, namespace: Namespace, kind: Kind, opts: ListOptions) -> StateResult<Watch> {
        self.subscribe(namespace, kind, Filter::Kind(opts))
    }

    /// Watches a single identity, whether or not it exists yet.
    pub fn watch(&self, id: &ResourceId) -> StateResult<Watch> {
        self.subscribe(id.namespace, id.kind, Filter::Id(id.id.clone()))
    }

    fn subscribe(&self, namespace: Namespace, kind: Kind, filter: Filter) -> StateResult<Watch> {
        let t = self.table(namespace, kind)?;
        let mut g = Self::write(&t);
        let snapshot: Vec<Resource> = g.items.values().filter(|r| filter.matches(r)).cloned().collect();
        let (tx, rx) = mpsc::channel(self.opts.watch_buffer.max(1) + snapshot.len() + 1);
        for r in snapshot {
            let _ = tx.try_send(Event::Created(r));
        }
        let _ = tx.try_send(Event::Bootstrapped);
        let overflowed = Arc::new(AtomicBool::new(false));
        g.subscribers.push(Subscriber { filter, tx, overflowed: Arc::clone(&overflowed) });
        Ok(Watch::new(rx, overflowed))
    }

    /// Writer acting as `owner`; an empty owner means user access.
    pub fn as_owner(&self, owner: impl Into<String>) -> Scoped<'_> { Scoped { state: self, owner: owner.into() } }
}

/// State view bound to one owner.
pub struct Scoped<'a> {
    state: &'a State,
    owner: String,
}

impl Scoped<'_> {
    pub fn owner(&self) -> &str { &self.owner }
}

impl Reader for State {
    fn get(&self, id: &ResourceId) -> StateResult<Resource> { State::get(self, id) }
    fn list(&self, namespace: Namespace, kind: Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> {
        State::list(self, namespace, kind, opts)
    }
}

impl Reader for Scoped<'_> {
    fn get(&self, id: &ResourceId) -> StateResult<Resource> { self.state.get(id) }
    fn list(&self, namespace: Namespace, kind: Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> {
        self.state.list(namespace, kind, opts)
    }
}

impl Writer for Scoped<'_> {
    fn owner(&self) -> &str { &self.owner }

    fn create(&self, mut r: Resource) -> StateResult<Resource> {
        r.metadata.owner = self.owner.clone();
        self.state.create(r)
    }

    fn update(&self, expected: Version, mut r: Resource) -> StateResult<Resource> {
        r.metadata.owner = self.owner.clone();
        self.state.update(expected, r)
    }

    fn modify<F, E>(&self, mut template: Resource, f: F) -> Result<Resource, E>
    where
        F: FnMut(&mut Resource) -> Result<(), E>,
        E: From<StateError>,
    {
        template.metadata.owner = self.owner.clone();
        self.state.modify(template, f)
    }

    fn teardown(&self, id: &ResourceId) -> StateResult<bool> { self.state.teardown(id, &self.owner) }
    fn destroy(&self, id: &ResourceId) -> StateResult<()> { self.state.destroy(id, &self.owner, None) }
    fn add_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()> { self.state.add_finalizer(id, name) }
    fn remove_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()> { self.state.remove_finalizer(id, name) }
}
