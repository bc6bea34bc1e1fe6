use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bastion_core::StateError;
use bastion_resources::Resource;
use futures::Stream;
use tokio::sync::mpsc;

/// Change notification delivered to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Created(Resource),
    Updated { old: Resource, new: Resource },
    Destroyed(Resource),
    /// Initial snapshot has been delivered.
    Bootstrapped,
    Errored(StateError),
}

impl Event {
    /// Latest state carried by the event, if any.
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Event::Created(r) | Event::Destroyed(r) => Some(r),
            Event::Updated { new, .. } => Some(new),
            Event::Bootstrapped | Event::Errored(_) => None,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Event::Created(_) => "created",
            Event::Updated { .. } => "updated",
            Event::Destroyed(_) => "destroyed",
            Event::Bootstrapped => "bootstrapped",
            Event::Errored(_) => "errored",
        }
    }
}

/// Subscription handle. Ends with `Errored(WatchOverflow)` if the store
/// dropped the subscription because the buffer filled up.
pub struct Watch {
    rx: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    finished: bool,
}

impl Watch {
    pub(crate) fn new(rx: mpsc::Receiver<Event>, overflowed: Arc<AtomicBool>) -> Self {
        Self { rx, overflowed, finished: false }
    }

    pub async fn recv(&mut self) -> Option<Event> { futures::future::poll_fn(|cx| self.poll_event(cx)).await }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(ev)) => Poll::Ready(Some(ev)),
            Poll::Ready(None) => {
                self.finished = true;
                if self.overflowed.load(Ordering::Acquire) {
                    Poll::Ready(Some(Event::Errored(StateError::WatchOverflow)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for Watch {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> { self.get_mut().poll_event(cx) }
}
