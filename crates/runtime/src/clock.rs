//! Time source injected into controllers and probes.
//!
//! `SystemClock` is backed by tokio timers. `MockClock` keeps virtual time that
//! only moves on [`MockClock::advance`], so tests drive tickers deterministically.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Wall-clock time used for certificate validity stamps.
    fn wall(&self) -> SystemTime;

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;

    fn sleep(&self, d: Duration) -> BoxFuture<'static, ()> { self.sleep_until(self.now() + d) }
}

/// Periodic ticks. Missed deadlines are delivered back to back, one per period.
pub struct Ticker {
    clock: Arc<dyn Clock>,
    period: Duration,
    next: Instant,
}

impl Ticker {
    /// First tick fires one period from now.
    pub fn new(clock: Arc<dyn Clock>, period: Duration) -> Self {
        let next = clock.now() + period;
        Self { clock, period, next }
    }

    pub fn period(&self) -> Duration { self.period }

    pub async fn tick(&mut self) {
        let deadline = self.next;
        self.clock.sleep_until(deadline).await;
        self.next = deadline + self.period;
    }

    /// Restarts the schedule from now with a new period.
    pub fn reset(&mut self, period: Duration) {
        self.period = period;
        self.next = self.clock.now() + period;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant { Instant::now() }
    fn wall(&self) -> SystemTime { SystemTime::now() }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).boxed()
    }
}

struct MockInner {
    now: Instant,
    wall: SystemTime,
    sleepers: Vec<(Instant, oneshot::Sender<()>)>,
}

/// Virtual clock for tests.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockInner>>,
}

impl Default for MockClock {
    fn default() -> Self { Self::new() }
}

impl MockClock {
    pub fn new() -> Self {
        let inner = MockInner { now: Instant::now(), wall: SystemTime::now(), sleepers: Vec::new() };
        Self { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Moves virtual time forward and wakes every sleeper whose deadline passed.
    pub fn advance(&self, d: Duration) {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        g.now += d;
        g.wall += d;
        let now = g.now;
        let (due, pending): (Vec<_>, Vec<_>) = g.sleepers.drain(..).partition(|(at, _)| *at <= now);
        g.sleepers = pending;
        drop(g);
        for (_, tx) in due {
            let _ = tx.send(());
        }
    }

    /// Number of sleepers currently parked on the clock.
    pub fn sleepers(&self) -> usize {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        g.sleepers.retain(|(_, tx)| !tx.is_closed());
        g.sleepers.len()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant { self.inner.lock().unwrap_or_else(PoisonError::into_inner).now }
    fn wall(&self) -> SystemTime { self.inner.lock().unwrap_or_else(PoisonError::into_inner).wall }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if deadline <= g.now {
            return futures::future::ready(()).boxed();
        }
        let (tx, rx) = oneshot::channel();
        g.sleepers.push((deadline, tx));
        async move {
            let _ = rx.await;
        }
        .boxed()
    }
}
