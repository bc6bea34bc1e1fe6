#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bastion_runtime::{RateLimitedTrigger, SystemClock, Trigger};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Counting(AtomicUsize);

impl Trigger for Counting {
    fn queue_reconcile(&self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tight_loop_is_limited_to_rate_plus_burst() {
    let downstream = Arc::new(Counting::default());
    let ctx = CancellationToken::new();
    let (trigger, task) = RateLimitedTrigger::new(ctx.clone(), Arc::clone(&downstream), Arc::new(SystemClock));

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(1) {
        trigger.queue_reconcile();
        tokio::task::yield_now().await;
    }
    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

    let woken = downstream.0.load(Ordering::SeqCst);
    assert!((9..=19).contains(&woken), "woken {woken} times");
}

#[tokio::test]
async fn queue_reconcile_never_blocks_without_consumer() {
    let downstream = Arc::new(Counting::default());
    let ctx = CancellationToken::new();
    ctx.cancel();
    let (trigger, task) = RateLimitedTrigger::new(ctx, Arc::clone(&downstream), Arc::new(SystemClock));
    task.await.unwrap();
    for _ in 0..1000 {
        trigger.queue_reconcile();
    }
    assert_eq!(downstream.0.load(Ordering::SeqCst), 0);
}
