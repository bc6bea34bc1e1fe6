use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bastion_core::Kind;
use bastion_store::State;
use futures::FutureExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::RestartBackoff;
use crate::controller::{Controller, InputKind, OutputKind};
use crate::handle::ControllerHandle;
use crate::{RuntimeError, RuntimeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeRole {
    Input(InputKind),
    Output(OutputKind),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub controller: String,
    pub kind: Kind,
    pub role: EdgeRole,
}

/// Static wiring between controllers and kinds.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn producers(&self, kind: Kind) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.kind == kind && matches!(e.role, EdgeRole::Output(_)))
            .map(|e| e.controller.as_str())
            .collect()
    }

    pub fn consumers(&self, kind: Kind) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .edges
            .iter()
            .filter(|e| e.kind == kind && matches!(e.role, EdgeRole::Input(_)))
            .map(|e| e.controller.as_str())
            .collect();
        out.dedup();
        out
    }

    /// Kind to the controllers woken when it changes.
    pub fn fan_out(&self) -> BTreeMap<Kind, Vec<String>> {
        let mut out: BTreeMap<Kind, Vec<String>> = BTreeMap::new();
        for e in self.edges.iter().filter(|e| matches!(e.role, EdgeRole::Input(_))) {
            let v = out.entry(e.kind).or_default();
            if !v.contains(&e.controller) {
                v.push(e.controller.clone());
            }
        }
        out
    }
}

/// Owns registered controllers until [`Runtime::run`].
pub struct Runtime {
    state: Arc<State>,
    opts: RuntimeOptions,
    controllers: Vec<Box<dyn Controller>>,
    producers: BTreeMap<Kind, (OutputKind, Vec<String>)>,
}

impl Runtime {
    pub fn new(state: Arc<State>) -> Self { Self::with_options(state, RuntimeOptions::default()) }

    pub fn with_options(state: Arc<State>, opts: RuntimeOptions) -> Self {
        Self { state, opts, controllers: Vec::new(), producers: BTreeMap::new() }
    }

    pub fn state(&self) -> &Arc<State> { &self.state }

    pub fn register<C: Controller>(&mut self, c: C) -> Result<(), RuntimeError> { self.register_boxed(Box::new(c)) }

    /// Validates name uniqueness, kind registration and output exclusivity.
    pub fn register_boxed(&mut self, c: Box<dyn Controller>) -> Result<(), RuntimeError> {
        let name = c.name().to_string();
        if self.controllers.iter().any(|x| x.name() == name) {
            return Err(RuntimeError::DuplicateController(name));
        }
        let registry = self.state.registry();
        for kind in c.inputs().iter().map(|i| i.kind).chain(c.outputs().iter().map(|o| o.kind)) {
            if !registry.contains(kind) {
                return Err(RuntimeError::UnknownKind { controller: name, kind });
            }
        }
        for o in c.outputs() {
            if let Some((excl, names)) = self.producers.get(&o.kind) {
                if *excl == OutputKind::Exclusive || o.exclusivity == OutputKind::Exclusive {
                    let existing = names.first().cloned().unwrap_or_default();
                    return Err(RuntimeError::OutputConflict { kind: o.kind, existing, controller: name });
                }
            }
        }
        for o in c.outputs() {
            self.producers.entry(o.kind).or_insert_with(|| (o.exclusivity, Vec::new())).1.push(name.clone());
        }
        debug!(controller = %name, "controller registered");
        self.controllers.push(c);
        Ok(())
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut edges = Vec::new();
        for c in &self.controllers {
            for i in c.inputs() {
                edges.push(DependencyEdge { controller: c.name().to_string(), kind: i.kind, role: EdgeRole::Input(i.strength) });
            }
            for o in c.outputs() {
                edges.push(DependencyEdge { controller: c.name().to_string(), kind: o.kind, role: EdgeRole::Output(o.exclusivity) });
            }
        }
        edges.sort();
        DependencyGraph { edges }
    }

    /// Runs every controller until `ctx` is cancelled and all of them unwound.
    pub async fn run(self, ctx: CancellationToken) {
        let n = self.controllers.len();
        let mut tasks = Vec::with_capacity(n);
        for c in self.controllers {
            tasks.push(tokio::spawn(drive(c, Arc::clone(&self.state), ctx.clone(), self.opts.clone())));
        }
        info!(controllers = n, "runtime started");
        for res in futures::future::join_all(tasks).await {
            if let Err(e) = res {
                error!(error = %e, "controller task panicked");
            }
        }
        info!("runtime stopped");
    }
}

async fn drive(mut c: Box<dyn Controller>, state: Arc<State>, ctx: CancellationToken, opts: RuntimeOptions) {
    let name = c.name().to_string();
    let span = info_span!("controller", name = %name);
    let reset = Arc::new(AtomicBool::new(false));
    let mut backoff = RestartBackoff::new(opts.backoff_initial, opts.backoff_max);
    loop {
        let mut handle = ControllerHandle::new(name.clone(), Arc::clone(&state), c.outputs(), ctx.clone(), Arc::clone(&reset));
        handle.update_inputs(c.inputs()).await;
        let res = AssertUnwindSafe(c.run(ctx.clone(), &mut handle).instrument(span.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("controller panicked: {}", panic_message(&*panic))));
        handle.stop_watchers().await;
        if ctx.is_cancelled() {
            debug!(controller = %name, "controller stopped");
            return;
        }
        match res {
            Ok(()) => {
                debug!(controller = %name, "controller finished");
                return;
            }
            Err(e) => {
                counter!("controller_restarts_total", 1u64, "controller" => name.clone());
                if reset.swap(false, Ordering::AcqRel) {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                warn!(controller = %name, error = %format!("{e:#}"), delay_ms = delay.as_millis() as u64, "controller failed; restarting");
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}
