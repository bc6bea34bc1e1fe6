//! Rate-limited reconcile trigger.
//!
//! External event sources (link changes and the like) can fire far faster than
//! a controller should reconcile. [`RateLimitedTrigger`] coalesces bursts into a
//! single pending wakeup and forwards at most one wakeup per token of a
//! [`TokenBucket`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::RuntimeError;

/// Anything that can wake a controller.
pub trait Trigger: Send + Sync + 'static {
    fn queue_reconcile(&self);
}

impl<T: Trigger + ?Sized> Trigger for Arc<T> {
    fn queue_reconcile(&self) { (**self).queue_reconcile() }
}

/// Token bucket holding up to `burst` tokens, refilled at `rate` per second.
pub struct TokenBucket {
    clock: Arc<dyn Clock>,
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub const DEFAULT_RATE: f64 = 10.0;
    pub const DEFAULT_BURST: u32 = 5;

    /// Starts full. `rate` must be positive and finite.
    pub fn new(clock: Arc<dyn Clock>, rate: f64, burst: u32) -> Result<Self, RuntimeError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(RuntimeError::InvalidRate(rate));
        }
        Ok(Self::full(clock, rate, burst))
    }

    fn full(clock: Arc<dyn Clock>, rate: f64, burst: u32) -> Self {
        let last = clock.now();
        let burst = f64::from(burst.max(1));
        Self { clock, rate, burst, tokens: burst, last }
    }

    fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return true;
        }
        false
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.rate);
            self.clock.sleep(wait).await;
        }
    }
}

/// Non-blocking front of a forwarding task. Dropping every clone of the
/// trigger or cancelling the token ends the task.
#[derive(Clone)]
pub struct RateLimitedTrigger {
    tx: mpsc::Sender<()>,
}

impl RateLimitedTrigger {
    pub fn new<T: Trigger>(ctx: CancellationToken, downstream: T, clock: Arc<dyn Clock>) -> (Self, JoinHandle<()>) {
        let bucket = TokenBucket::full(clock, TokenBucket::DEFAULT_RATE, TokenBucket::DEFAULT_BURST);
        Self::with_bucket(ctx, downstream, bucket)
    }

    pub fn with_bucket<T: Trigger>(ctx: CancellationToken, downstream: T, mut bucket: TokenBucket) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    ev = rx.recv() => {
                        if ev.is_none() { break; }
                    }
                }
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = bucket.acquire() => downstream.queue_reconcile(),
                }
            }
            debug!("rate limited trigger stopped");
        });
        (Self { tx }, task)
    }
}

impl Trigger for RateLimitedTrigger {
    fn queue_reconcile(&self) { let _ = self.tx.try_send(()); }
}
