//! Bastion core types: resource identity, metadata, list queries and state errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

mod error;
mod query;

pub use error::{StateError, StateResult};
pub use query::{LabelQuery, LabelTerm, ListOptions};

/// Namespace partitions unrelated domains (`secrets`, `network`, ...).
pub type Namespace = &'static str;

/// Monotonic resource version, bumped on every accepted create/update.
pub type Version = u64;

/// Version carried by resources that were never committed.
pub const VERSION_UNDEFINED: Version = 0;

/// Symbolic type name of a resource kind, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Kind(pub &'static str);

impl Kind {
    pub fn as_str(&self) -> &'static str { self.0 }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.0) }
}

/// Composite identity `(namespace, kind, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId {
    pub namespace: Namespace,
    pub kind: Kind,
    pub id: String,
}

impl ResourceId {
    pub fn new(namespace: Namespace, kind: Kind, id: impl Into<String>) -> Self {
        Self { namespace, kind, id: id.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearingDown"),
        }
    }
}

/// Ordered set of finalizer names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Finalizers(SmallVec<[String; 2]>);

impl Finalizers {
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn has(&self, name: &str) -> bool { self.0.iter().any(|f| f == name) }
    pub fn iter(&self) -> impl Iterator<Item = &str> { self.0.iter().map(|s| s.as_str()) }

    /// Returns false if the finalizer was already present.
    pub fn add(&mut self, name: &str) -> bool {
        if self.has(name) { return false; }
        self.0.push(name.to_string());
        true
    }

    /// Returns false if the finalizer was not present.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.0.iter().position(|f| f == name) {
            Some(idx) => { self.0.remove(idx); true }
            None => false,
        }
    }

    pub fn to_vec(&self) -> Vec<String> { self.0.to_vec() }
}

/// Resource metadata. Everything except labels/annotations is load-bearing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub namespace: Namespace,
    pub kind: Kind,
    pub id: String,
    pub version: Version,
    pub phase: Phase,
    /// Controller that produced the resource, empty if user-created.
    pub owner: String,
    pub finalizers: Finalizers,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Wall-clock millis; informational only.
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl Metadata {
    pub fn new(namespace: Namespace, kind: Kind, id: impl Into<String>) -> Self {
        Self {
            namespace,
            kind,
            id: id.into(),
            version: VERSION_UNDEFINED,
            phase: Phase::Running,
            owner: String::new(),
            finalizers: Finalizers::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_ts: 0,
            updated_ts: 0,
        }
    }

    pub fn pointer(&self) -> ResourceId { ResourceId::new(self.namespace, self.kind, self.id.clone()) }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn is_tearing_down(&self) -> bool { self.phase == Phase::TearingDown }

    /// Compares the parts of metadata a producer controls; bookkeeping fields are ignored.
    pub fn same_content(&self, other: &Metadata) -> bool {
        self.labels == other.labels && self.annotations == other.annotations
    }
}

pub fn now_ts() -> i64 { chrono::Utc::now().timestamp_millis() }

pub mod prelude {
    pub use super::{
        Finalizers, Kind, LabelQuery, ListOptions, Metadata, Namespace, Phase, ResourceId, StateError,
        StateResult, Version,
    };
}
