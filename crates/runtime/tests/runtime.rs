#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bastion_core::{ListOptions, StateError};
use bastion_resources::network::{ProbeSpec, ProbeStatusSpec};
use bastion_resources::time::TimeStatusSpec;
use bastion_resources::{Resource, ResourceRegistry, TypedSpec};
use bastion_runtime::{Controller, ControllerHandle, Input, Output, Runtime, RuntimeError, RuntimeOptions};
use bastion_store::{safe, Event, State, Writer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mirrors every ProbeSpec into a successful ProbeStatus.
struct Mirror;

#[async_trait]
impl Controller for Mirror {
    fn name(&self) -> &str { "MirrorController" }
    fn inputs(&self) -> Vec<Input> { vec![Input::weak::<ProbeSpec>()] }
    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ProbeStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }
            for spec in safe::list::<ProbeSpec, _>(&*r, &ListOptions::default())? {
                safe::modify::<ProbeStatusSpec, _, _, anyhow::Error>(&*r, &spec.metadata.id, |st| {
                    st.success = true;
                    Ok(())
                })?;
            }
        }
    }
}

/// Fails until it ran `fail_times` times.
struct Flaky {
    runs: Arc<AtomicUsize>,
    fail_times: usize,
}

#[async_trait]
impl Controller for Flaky {
    fn name(&self) -> &str { "FlakyController" }
    fn inputs(&self) -> Vec<Input> { Vec::new() }
    fn outputs(&self) -> Vec<Output> { vec![Output::shared::<TimeStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, _r: &mut ControllerHandle) -> anyhow::Result<()> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_times {
            anyhow::bail!("transient failure #{n}");
        }
        ctx.cancelled().await;
        Ok(())
    }
}

struct Named {
    name: &'static str,
    outputs: Vec<Output>,
}

#[async_trait]
impl Controller for Named {
    fn name(&self) -> &str { self.name }
    fn inputs(&self) -> Vec<Input> { vec![Input::weak::<ProbeStatusSpec>()] }
    fn outputs(&self) -> Vec<Output> { self.outputs.clone() }

    async fn run(&mut self, ctx: CancellationToken, _r: &mut ControllerHandle) -> anyhow::Result<()> {
        ctx.cancelled().await;
        Ok(())
    }
}

fn state() -> Arc<State> { Arc::new(State::new(ResourceRegistry::with_all())) }

#[test]
fn registration_validates_names_and_exclusivity() {
    let mut rt = Runtime::new(state());
    rt.register(Named { name: "A", outputs: vec![Output::shared::<TimeStatusSpec>()] }).unwrap();
    rt.register(Named { name: "B", outputs: vec![Output::shared::<TimeStatusSpec>()] }).unwrap();
    let dup = rt.register(Named { name: "A", outputs: vec![] }).unwrap_err();
    assert!(matches!(dup, RuntimeError::DuplicateController(_)));
    let excl = rt.register(Named { name: "C", outputs: vec![Output::exclusive::<TimeStatusSpec>()] }).unwrap_err();
    assert!(matches!(excl, RuntimeError::OutputConflict { .. }));

    rt.register(Named { name: "D", outputs: vec![Output::exclusive::<ProbeStatusSpec>()] }).unwrap();
    let excl = rt.register(Named { name: "E", outputs: vec![Output::shared::<ProbeStatusSpec>()] }).unwrap_err();
    assert!(matches!(excl, RuntimeError::OutputConflict { .. }));

    let mut partial = ResourceRegistry::new();
    partial.register::<ProbeStatusSpec>();
    let mut rt = Runtime::new(Arc::new(State::new(partial)));
    let err = rt.register(Named { name: "F", outputs: vec![Output::shared::<TimeStatusSpec>()] }).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownKind { .. }));
}

#[test]
fn dependency_graph_reports_fan_out() {
    let mut rt = Runtime::new(state());
    rt.register(Mirror).unwrap();
    rt.register(Named { name: "Watcher", outputs: vec![] }).unwrap();
    let g = rt.dependency_graph();
    assert_eq!(g.producers(ProbeStatusSpec::KIND), vec!["MirrorController"]);
    assert_eq!(g.consumers(ProbeStatusSpec::KIND), vec!["Watcher"]);
    let fan = g.fan_out();
    assert_eq!(fan.get(&ProbeSpec::KIND).cloned(), Some(vec!["MirrorController".to_string()]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn input_changes_wake_the_controller() {
    let st = state();
    let mut watch = st.watch(&ProbeStatusSpec::resource_id("p1")).unwrap();
    let mut rt = Runtime::new(Arc::clone(&st));
    rt.register(Mirror).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    st.create(Resource::new("p1", ProbeSpec::default())).unwrap();

    let created = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match watch.recv().await {
                Some(Event::Created(r)) => break r,
                Some(_) => continue,
                None => panic!("watch closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(created.metadata.owner, "MirrorController");

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_controllers_restart_with_backoff() {
    let runs = Arc::new(AtomicUsize::new(0));
    let opts = RuntimeOptions { backoff_initial: Duration::from_millis(10), backoff_max: Duration::from_millis(40) };
    let mut rt = Runtime::with_options(state(), opts);
    rt.register(Flaky { runs: Arc::clone(&runs), fail_times: 3 }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while runs.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

/// Exercises handle-level guards from inside a controller.
struct Guarded {
    out: Arc<std::sync::Mutex<Vec<StateError>>>,
}

#[async_trait]
impl Controller for Guarded {
    fn name(&self) -> &str { "GuardedController" }
    fn inputs(&self) -> Vec<Input> { vec![Input::weak::<ProbeSpec>()] }
    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ProbeStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        r.next_event().await;
        let mut errs = Vec::new();
        errs.push(r.create(Resource::new("t", TimeStatusSpec::default())).unwrap_err());
        errs.push(r.add_finalizer(&ProbeSpec::resource_id("p"), "GuardedController").unwrap_err());
        r.update_inputs(vec![Input::strong::<ProbeSpec>()]).await;
        r.add_finalizer(&ProbeSpec::resource_id("p"), "GuardedController")?;
        if let Ok(mut g) = self.out.lock() {
            g.extend(errs);
        }
        ctx.cancelled().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handle_enforces_outputs_and_strong_inputs() {
    let st = state();
    st.create(Resource::new("p", ProbeSpec::default())).unwrap();
    let out = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut rt = Runtime::new(Arc::clone(&st));
    rt.register(Guarded { out: Arc::clone(&out) }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if st.get(&ProbeSpec::resource_id("p")).unwrap().metadata.finalizers.has("GuardedController") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    let errs = out.lock().unwrap();
    assert_eq!(errs.len(), 2);
    assert!(matches!(&errs[0], StateError::OwnershipViolation { actor, .. } if actor == "GuardedController"));
    assert!(matches!(errs[1], StateError::Invalid(_)));
}

async fn until(what: &str, mut f: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Destroys every ProbeSpec it sees, counting wakeups.
struct Reaper {
    wakes: Arc<AtomicUsize>,
}

#[async_trait]
impl Controller for Reaper {
    fn name(&self) -> &str { "ReaperController" }
    fn inputs(&self) -> Vec<Input> { vec![Input::weak::<ProbeSpec>()] }
    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ProbeSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }
            self.wakes.fetch_add(1, Ordering::SeqCst);
            for spec in safe::list::<ProbeSpec, _>(&*r, &ListOptions::default())? {
                r.destroy(&spec.metadata.pointer())?;
            }
        }
    }
}

#[tokio::test]
async fn change_right_after_first_reconcile_wakes_again() {
    let st = state();
    let mut p = Resource::new("p", ProbeSpec::default());
    p.metadata.owner = "ReaperController".into();
    st.create(p).unwrap();

    let wakes = Arc::new(AtomicUsize::new(0));
    let mut rt = Runtime::new(Arc::clone(&st));
    rt.register(Reaper { wakes: Arc::clone(&wakes) }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    until("wake after destroy", || wakes.load(Ordering::SeqCst) >= 2).await;
    assert!(st.get(&ProbeSpec::resource_id("p")).unwrap_err().is_not_found());

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}

/// Panics on its first run only.
struct Panicky {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Controller for Panicky {
    fn name(&self) -> &str { "PanickyController" }
    fn inputs(&self) -> Vec<Input> { Vec::new() }
    fn outputs(&self) -> Vec<Output> { Vec::new() }

    async fn run(&mut self, ctx: CancellationToken, _r: &mut ControllerHandle) -> anyhow::Result<()> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first run blows up");
        }
        ctx.cancelled().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_controller_is_restarted() {
    let runs = Arc::new(AtomicUsize::new(0));
    let opts = RuntimeOptions { backoff_initial: Duration::from_millis(10), backoff_max: Duration::from_millis(40) };
    let mut rt = Runtime::with_options(state(), opts);
    rt.register(Panicky { runs: Arc::clone(&runs) }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    until("restart after panic", || runs.load(Ordering::SeqCst) >= 2).await;

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Reports progress before every failure.
struct Progressing {
    starts: Arc<std::sync::Mutex<Vec<Instant>>>,
    fail_times: usize,
}

#[async_trait]
impl Controller for Progressing {
    fn name(&self) -> &str { "ProgressingController" }
    fn inputs(&self) -> Vec<Input> { Vec::new() }
    fn outputs(&self) -> Vec<Output> { Vec::new() }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let n = {
            let mut starts = self.starts.lock().unwrap();
            starts.push(Instant::now());
            starts.len()
        };
        if n <= self.fail_times {
            r.reset_restart_backoff();
            anyhow::bail!("failure #{n} after progress");
        }
        ctx.cancelled().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_resets_restart_backoff() {
    let starts = Arc::new(std::sync::Mutex::new(Vec::new()));
    let opts = RuntimeOptions { backoff_initial: Duration::from_millis(100), backoff_max: Duration::from_secs(60) };
    let mut rt = Runtime::with_options(state(), opts);
    rt.register(Progressing { starts: Arc::clone(&starts), fail_times: 5 }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    until("six runs", || starts.lock().unwrap().len() >= 6).await;
    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

    // Doubling would make the fourth gap 800ms.
    let starts = starts.lock().unwrap();
    for gap in starts.windows(2).map(|w| w[1] - w[0]) {
        assert!(gap >= Duration::from_millis(90), "gap {gap:?} shorter than the initial delay");
        assert!(gap < Duration::from_millis(350), "gap {gap:?} grew after a reset");
    }
}

/// Swaps its ProbeSpec input for a TimeStatus input and reports whether
/// anything still wakes it from the old set.
struct Switcher {
    report: mpsc::UnboundedSender<&'static str>,
}

#[async_trait]
impl Controller for Switcher {
    fn name(&self) -> &str { "SwitcherController" }
    fn inputs(&self) -> Vec<Input> { vec![Input::weak::<ProbeSpec>()] }
    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ProbeSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        r.next_event().await;
        safe::modify::<ProbeSpec, _, _, anyhow::Error>(&*r, "p", |p| {
            p.failure_threshold = 1;
            Ok(())
        })?;
        // Let the change land as a pending wakeup.
        tokio::time::sleep(Duration::from_millis(100)).await;

        r.update_inputs(vec![Input::weak::<TimeStatusSpec>()]).await;
        r.next_event().await;
        safe::modify::<ProbeSpec, _, _, anyhow::Error>(&*r, "p", |p| {
            p.failure_threshold = 2;
            Ok(())
        })?;
        let woken = tokio::time::timeout(Duration::from_millis(200), r.next_event()).await.is_ok();
        let _ = self.report.send(if woken { "stale wake" } else { "quiet" });

        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = r.next_event() => {}
        }
        let _ = self.report.send("new input");
        ctx.cancelled().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_inputs_drops_events_of_old_inputs() {
    let st = state();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut rt = Runtime::new(Arc::clone(&st));
    rt.register(Switcher { report: tx }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(first, Some("quiet"));

    st.create(Resource::new("t", TimeStatusSpec::default())).unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(second, Some("new input"));

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}

/// Counts wakeups from a destroy-ready input.
struct Finalizing {
    wakes: Arc<AtomicUsize>,
}

#[async_trait]
impl Controller for Finalizing {
    fn name(&self) -> &str { "FinalizingController" }
    fn inputs(&self) -> Vec<Input> { vec![Input::destroy_ready::<ProbeSpec>()] }
    fn outputs(&self) -> Vec<Output> { Vec::new() }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_ready_input_wakes_only_when_consumer_holds_the_last_finalizers() {
    let st = state();
    let id = ProbeSpec::resource_id("p");
    st.create(Resource::new("p", ProbeSpec::default())).unwrap();
    st.add_finalizer(&id, "FinalizingController").unwrap();
    st.add_finalizer(&id, "other").unwrap();

    let wakes = Arc::new(AtomicUsize::new(0));
    let mut rt = Runtime::new(Arc::clone(&st));
    rt.register(Finalizing { wakes: Arc::clone(&wakes) }).unwrap();
    let ctx = CancellationToken::new();
    let running = tokio::spawn(rt.run(ctx.clone()));
    until("initial reconcile", || wakes.load(Ordering::SeqCst) == 1).await;

    let cur = st.get(&id).unwrap();
    st.update(cur.version(), Resource::new("p", ProbeSpec { failure_threshold: 9, ..Default::default() })).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(wakes.load(Ordering::SeqCst), 1, "woken by a plain update");

    assert!(!st.teardown(&id, "").unwrap());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(wakes.load(Ordering::SeqCst), 1, "woken while a foreign finalizer remains");

    st.remove_finalizer(&id, "other").unwrap();
    until("destroy-ready wake", || wakes.load(Ordering::SeqCst) == 2).await;

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
}
