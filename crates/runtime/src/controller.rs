use async_trait::async_trait;
use bastion_core::{Kind, Namespace};
use bastion_resources::TypedSpec;
use tokio_util::sync::CancellationToken;

use crate::handle::ControllerHandle;

/// How an input reacts to changes of the referenced resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputKind {
    /// Any change queues a reconcile.
    Weak,
    /// Like `Weak`, and the controller may hold finalizers on the resources.
    Strong,
    /// Only resources in teardown whose remaining finalizers belong to the consumer.
    DestroyReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Input {
    pub namespace: Namespace,
    pub kind: Kind,
    pub id: Option<String>,
    pub strength: InputKind,
}

impl Input {
    pub fn of<T: TypedSpec>(strength: InputKind) -> Self {
        Self { namespace: T::NAMESPACE, kind: T::KIND, id: None, strength }
    }

    pub fn weak<T: TypedSpec>() -> Self { Self::of::<T>(InputKind::Weak) }
    pub fn strong<T: TypedSpec>() -> Self { Self::of::<T>(InputKind::Strong) }
    pub fn destroy_ready<T: TypedSpec>() -> Self { Self::of::<T>(InputKind::DestroyReady) }

    pub fn weak_id<T: TypedSpec>(id: impl Into<String>) -> Self { Self::weak::<T>().with_id(id) }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub(crate) fn covers(&self, namespace: Namespace, kind: Kind, id: &str) -> bool {
        self.namespace == namespace && self.kind == kind && self.id.as_deref().map(|x| x == id).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputKind {
    /// Sole producer of the kind process-wide.
    Exclusive,
    /// Several producers, each owning its own ids.
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Output {
    pub kind: Kind,
    pub exclusivity: OutputKind,
}

impl Output {
    pub fn exclusive<T: TypedSpec>() -> Self { Self { kind: T::KIND, exclusivity: OutputKind::Exclusive } }
    pub fn shared<T: TypedSpec>() -> Self { Self { kind: T::KIND, exclusivity: OutputKind::Shared } }
}

/// A reconciler. `run` is a long-lived loop that waits on
/// [`ControllerHandle::next_event`] and must return promptly once `ctx` is
/// cancelled. Returning an error or panicking restarts the controller with
/// backoff.
#[async_trait]
pub trait Controller: Send + 'static {
    fn name(&self) -> &str;
    fn inputs(&self) -> Vec<Input>;
    fn outputs(&self) -> Vec<Output>;
    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()>;
}
