//! Bastion controller runtime.
//!
//! Controllers declare inputs and outputs, the runtime subscribes them to their
//! inputs and drives each one in its own task, restarting failed controllers
//! with exponential backoff.

#![forbid(unsafe_code)]

use std::time::Duration;

use bastion_core::Kind;

mod backoff;
pub mod clock;
mod controller;
mod handle;
mod runtime;
pub mod trigger;

pub use backoff::RestartBackoff;
pub use clock::{Clock, MockClock, SystemClock, Ticker};
pub use controller::{Controller, Input, InputKind, Output, OutputKind};
pub use handle::{ControllerHandle, ReconcileTrigger};
pub use runtime::{DependencyEdge, DependencyGraph, EdgeRole, Runtime};
pub use trigger::{RateLimitedTrigger, TokenBucket, Trigger};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("controller {0:?} is already registered")]
    DuplicateController(String),
    #[error("kind {kind} is already produced exclusively by {existing:?}, conflicting with {controller:?}")]
    OutputConflict { kind: Kind, existing: String, controller: String },
    #[error("controller {controller:?} declares unregistered kind {kind}")]
    UnknownKind { controller: String, kind: Kind },
    #[error("token bucket rate must be positive, got {0}")]
    InvalidRate(f64),
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self { Self { backoff_initial: Duration::from_millis(200), backoff_max: Duration::from_secs(30) } }
}

pub mod prelude {
    pub use super::{Clock, Controller, ControllerHandle, Input, Output, Runtime, Trigger};
    pub use tokio_util::sync::CancellationToken;
}
