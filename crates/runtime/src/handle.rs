use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bastion_core::{Kind, ListOptions, Namespace, ResourceId, StateError, StateResult, Version};
use bastion_resources::Resource;
use bastion_store::{Event, Reader, State, Watch, Writer};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::{Input, InputKind, Output};
use crate::trigger::Trigger;

/// Wakes the owning controller; cloneable and non-blocking.
#[derive(Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<()>,
}

impl Trigger for ReconcileTrigger {
    fn queue_reconcile(&self) { let _ = self.tx.try_send(()); }
}

/// Per-controller view of the runtime: store access scoped to the controller's
/// outputs and the reconcile event channel fed by its inputs.
pub struct ControllerHandle {
    name: String,
    state: Arc<State>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
    watchers: CancellationToken,
    forwarders: Vec<JoinHandle<()>>,
    parent: CancellationToken,
    backoff_reset: Arc<AtomicBool>,
}

impl ControllerHandle {
    pub(crate) fn new(
        name: String,
        state: Arc<State>,
        outputs: Vec<Output>,
        parent: CancellationToken,
        backoff_reset: Arc<AtomicBool>,
    ) -> Self {
        // Capacity 1: bursts of input changes coalesce into one pending reconcile.
        let (tx, rx) = mpsc::channel(1);
        let watchers = parent.child_token();
        Self { name, state, inputs: Vec::new(), outputs, tx, rx, watchers, forwarders: Vec::new(), parent, backoff_reset }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn inputs(&self) -> &[Input] { &self.inputs }

    /// Waits for the next reconcile request. Never resolves to an error; pair
    /// it with `ctx.cancelled()` in a `select!`.
    pub async fn next_event(&mut self) {
        if self.rx.recv().await.is_some() {
            counter!("controller_reconcile_total", 1u64, "controller" => self.name.clone());
        }
    }

    pub fn queue_reconcile(&self) { let _ = self.tx.try_send(()); }

    pub fn trigger(&self) -> ReconcileTrigger { ReconcileTrigger { tx: self.tx.clone() } }

    /// Clears the restart delay after the controller made progress.
    pub fn reset_restart_backoff(&self) { self.backoff_reset.store(true, Ordering::Release); }

    /// Replaces the input set. Pending events from the previous inputs are
    /// dropped and one reconcile is queued for the new set.
    pub async fn update_inputs(&mut self, inputs: Vec<Input>) {
        self.stop_watchers().await;
        while self.rx.try_recv().is_ok() {}
        self.watchers = self.parent.child_token();
        for input in &inputs {
            let fwd = Forwarder {
                state: Arc::clone(&self.state),
                input: input.clone(),
                consumer: self.name.clone(),
                tx: self.tx.clone(),
                token: self.watchers.clone(),
            };
            // Must subscribe before the reconcile below is queued.
            match fwd.subscribe() {
                Ok(watch) => self.forwarders.push(tokio::spawn(fwd.run(watch))),
                Err(e) => warn!(controller = %self.name, kind = %input.kind, error = %e, "input subscription failed"),
            }
        }
        debug!(controller = %self.name, inputs = inputs.len(), "inputs updated");
        self.inputs = inputs;
        self.queue_reconcile();
    }

    pub(crate) async fn stop_watchers(&mut self) {
        self.watchers.cancel();
        for h in self.forwarders.drain(..) {
            let _ = h.await;
        }
    }

    fn check_output(&self, id: ResourceId) -> StateResult<()> {
        if self.outputs.iter().any(|o| o.kind == id.kind) {
            return Ok(());
        }
        let owner = self.state.get(&id).map(|r| r.metadata.owner).unwrap_or_default();
        Err(StateError::OwnershipViolation { id, owner, actor: self.name.clone() })
    }

    fn check_strong(&self, namespace: Namespace, kind: Kind, id: &str) -> StateResult<()> {
        if self.inputs.iter().any(|i| i.strength == InputKind::Strong && i.covers(namespace, kind, id)) {
            return Ok(());
        }
        Err(StateError::Invalid(format!("controller {:?} holds no strong input on {namespace}/{kind}/{id}", self.name)))
    }
}

impl Reader for ControllerHandle {
    fn get(&self, id: &ResourceId) -> StateResult<Resource> { self.state.get(id) }
    fn list(&self, namespace: Namespace, kind: Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> {
        self.state.list(namespace, kind, opts)
    }
}

impl Writer for ControllerHandle {
    fn owner(&self) -> &str { &self.name }

    fn create(&self, mut r: Resource) -> StateResult<Resource> {
        self.check_output(r.pointer())?;
        r.metadata.owner = self.name.clone();
        self.state.create(r)
    }

    fn update(&self, expected: Version, mut r: Resource) -> StateResult<Resource> {
        self.check_output(r.pointer())?;
        r.metadata.owner = self.name.clone();
        self.state.update(expected, r)
    }

    fn modify<F, E>(&self, mut template: Resource, f: F) -> Result<Resource, E>
    where
        F: FnMut(&mut Resource) -> Result<(), E>,
        E: From<StateError>,
    {
        self.check_output(template.pointer())?;
        template.metadata.owner = self.name.clone();
        self.state.modify(template, f)
    }

    fn teardown(&self, id: &ResourceId) -> StateResult<bool> {
        self.check_output(id.clone())?;
        self.state.teardown(id, &self.name)
    }

    fn destroy(&self, id: &ResourceId) -> StateResult<()> {
        self.check_output(id.clone())?;
        self.state.destroy(id, &self.name, None)
    }

    fn add_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()> {
        self.check_strong(id.namespace, id.kind, &id.id)?;
        self.state.add_finalizer(id, name)
    }

    fn remove_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()> { self.state.remove_finalizer(id, name) }
}

/// Turns watch events of one input into reconcile requests.
struct Forwarder {
    state: Arc<State>,
    input: Input,
    consumer: String,
    tx: mpsc::Sender<()>,
    token: CancellationToken,
}

impl Forwarder {
    fn relevant(&self, ev: &Event) -> bool {
        match (self.input.strength, ev) {
            (_, Event::Bootstrapped) | (_, Event::Errored(_)) => false,
            (_, Event::Destroyed(_)) => true,
            (InputKind::DestroyReady, ev) => ev
                .resource()
                .map(|r| r.metadata.is_tearing_down() && r.metadata.finalizers.iter().all(|f| f == self.consumer))
                .unwrap_or(false),
            _ => true,
        }
    }

    fn subscribe(&self) -> StateResult<Watch> {
        match &self.input.id {
            Some(id) => self.state.watch(&ResourceId::new(self.input.namespace, self.input.kind, id.clone())),
            None => self.state.watch_kind(self.input.namespace, self.input.kind, ListOptions::default()),
        }
    }

    /// Forwards changes from `watch`, resubscribing after an overflow. Snapshot
    /// events are skipped: a reconcile is already queued whenever a watch starts.
    async fn run(self, mut watch: Watch) {
        loop {
            let mut bootstrapped = false;
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    ev = watch.recv() => match ev {
                        None => return,
                        Some(Event::Bootstrapped) => bootstrapped = true,
                        Some(Event::Errored(e)) => {
                            warn!(controller = %self.consumer, kind = %self.input.kind, error = %e, "input watch lost; resubscribing");
                            break;
                        }
                        Some(ev) => {
                            if bootstrapped && self.relevant(&ev) {
                                let _ = self.tx.try_send(());
                            }
                        }
                    }
                }
            }
            watch = match self.subscribe() {
                Ok(w) => w,
                Err(e) => {
                    warn!(controller = %self.consumer, kind = %self.input.kind, error = %e, "input subscription failed");
                    return;
                }
            };
            let _ = self.tx.try_send(());
        }
    }
}
