//! TCP probes with a failure threshold, and the controllers that configure
//! them and publish their results.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bastion_core::ListOptions;
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::network::{ProbeSpec, ProbeStatusSpec, TcpProbeSpec};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use metrics::counter;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const NOTIFY_BUFFER: usize = 16;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Probe outcome delivered to the owner of the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub status: ProbeStatusSpec,
}

/// Connects to `endpoint`, giving up once `clock` reports `timeout` elapsed.
pub async fn tcp_probe(spec: &TcpProbeSpec, clock: &dyn Clock) -> Result<(), String> {
    let endpoint = spec.endpoint.as_str();
    let attempt = async {
        let addr = tokio::net::lookup_host(endpoint)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))?;
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        let stream = socket.connect(addr).await?;
        drop(stream);
        Ok::<_, io::Error>(())
    };
    tokio::select! {
        biased;
        _ = clock.sleep(spec.timeout) => Err(format!("dial tcp {endpoint}: i/o timeout")),
        res = attempt => res.map_err(|e| describe(endpoint, &e)),
    }
}

fn describe(endpoint: &str, e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut => {
            format!("dial tcp {endpoint}: {}", e.kind())
        }
        _ => format!("dial tcp {endpoint}: {e}"),
    }
}

/// Failure accounting. The first `threshold` consecutive failures are
/// tolerated; every later failure and every success is reported.
#[derive(Debug, Clone)]
pub(crate) struct Threshold {
    threshold: u32,
    failures: u32,
}

impl Threshold {
    pub(crate) fn new(threshold: u32) -> Self { Self { threshold, failures: 0 } }

    pub(crate) fn success(&mut self) -> bool {
        self.failures = 0;
        true
    }

    /// Returns whether to report; `exhausted` is true exactly when the tolerance runs out.
    pub(crate) fn failure(&mut self) -> (bool, bool) {
        if self.failures < self.threshold {
            self.failures += 1;
            return (false, self.failures == self.threshold);
        }
        (true, false)
    }
}

/// A periodic probe. The first attempt runs immediately on start.
pub struct Probe {
    id: String,
    spec: ProbeSpec,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Probe {
    pub fn new(id: impl Into<String>, spec: ProbeSpec, clock: Arc<dyn Clock>) -> Self {
        Self { id: id.into(), spec, clock, cancel: CancellationToken::new(), task: None }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn spec(&self) -> &ProbeSpec { &self.spec }

    pub fn start(&mut self, ctx: &CancellationToken, notify: mpsc::Sender<Notification>) {
        self.cancel = ctx.child_token();
        let run = ProbeLoop {
            id: self.id.clone(),
            spec: self.spec.clone(),
            clock: Arc::clone(&self.clock),
            cancel: self.cancel.clone(),
            notify,
        };
        self.task = Some(tokio::spawn(run.run()));
    }

    /// Cancels the probe and waits for its task.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct ProbeLoop {
    id: String,
    spec: ProbeSpec,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    notify: mpsc::Sender<Notification>,
}

impl ProbeLoop {
    async fn run(self) {
        let interval = if self.spec.interval.is_zero() { DEFAULT_INTERVAL } else { self.spec.interval };
        let mut ticker = Ticker::new(Arc::clone(&self.clock), interval);
        let mut threshold = Threshold::new(self.spec.failure_threshold);
        loop {
            let res = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = tcp_probe(&self.spec.tcp, &*self.clock) => res,
            };
            let status = match res {
                Ok(()) => {
                    counter!("probe_attempts_total", 1u64, "result" => "success");
                    threshold.success().then(|| ProbeStatusSpec { success: true, last_error: String::new() })
                }
                Err(e) => {
                    counter!("probe_attempts_total", 1u64, "result" => "failure");
                    let (report, exhausted) = threshold.failure();
                    if exhausted {
                        error!(probe = %self.id, error = %e, "probe failure threshold reached");
                    } else {
                        debug!(probe = %self.id, error = %e, "probe failed");
                    }
                    report.then(|| ProbeStatusSpec { success: false, last_error: e })
                }
            };
            if let Some(status) = status {
                let n = Notification { id: self.id.clone(), status };
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    sent = self.notify.send(n) => if sent.is_err() { return },
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
        }
    }
}

/// Runs one probe per `ProbeSpec` and publishes `ProbeStatus` under the same id.
pub struct ProbeController {
    clock: Arc<dyn Clock>,
}

impl ProbeController {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock } }

    async fn stop_all(probes: &mut BTreeMap<String, Probe>) {
        for (_, mut p) in std::mem::take(probes) {
            p.stop().await;
        }
    }
}

#[async_trait]
impl Controller for ProbeController {
    fn name(&self) -> &str { "network.ProbeController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak::<ProbeSpec>()] }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ProbeStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<Notification>(NOTIFY_BUFFER);
        let mut probes: BTreeMap<String, Probe> = BTreeMap::new();
        let res = self.reconcile_loop(&ctx, r, &tx, &mut rx, &mut probes).await;
        Self::stop_all(&mut probes).await;
        res
    }
}

impl ProbeController {
    async fn reconcile_loop(
        &self,
        ctx: &CancellationToken,
        r: &mut ControllerHandle,
        tx: &mpsc::Sender<Notification>,
        rx: &mut mpsc::Receiver<Notification>,
        probes: &mut BTreeMap<String, Probe>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                n = rx.recv() => {
                    if let Some(n) = n {
                        if probes.contains_key(&n.id) {
                            safe::modify::<ProbeStatusSpec, _, _, anyhow::Error>(&*r, &n.id, |st| {
                                *st = n.status.clone();
                                Ok(())
                            })
                            .context("error updating probe status")?;
                        }
                    }
                    continue;
                }
            }

            let specs: BTreeMap<String, ProbeSpec> = safe::list::<ProbeSpec, _>(&*r, &ListOptions::default())?
                .into_iter()
                .filter(|p| !p.metadata.is_tearing_down())
                .map(|p| (p.metadata.id, p.spec))
                .collect();

            let stale: Vec<String> =
                probes.iter().filter(|(id, p)| specs.get(*id) != Some(p.spec())).map(|(id, _)| id.clone()).collect();
            for id in stale {
                if let Some(mut p) = probes.remove(&id) {
                    p.stop().await;
                    debug!(probe = %id, "probe stopped");
                }
            }
            for (id, spec) in &specs {
                if probes.contains_key(id) {
                    continue;
                }
                let mut p = Probe::new(id.clone(), spec.clone(), Arc::clone(&self.clock));
                p.start(ctx, tx.clone());
                probes.insert(id.clone(), p);
                info!(probe = %id, endpoint = %spec.tcp.endpoint, "probe started");
            }
            safe::cleanup_outputs::<ProbeStatusSpec, _, _>(&*r, |id| specs.contains_key(id))?;
        }
    }
}

/// Publishes `ProbeSpec` resources from the machine config probe list.
#[derive(Debug, Default)]
pub struct ProbeConfigController;

#[async_trait]
impl Controller for ProbeConfigController {
    fn name(&self) -> &str { "network.ProbeConfigController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID)] }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ProbeSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let sections = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.machine.probes)
                .unwrap_or_default();
            let mut ids = Vec::with_capacity(sections.len());
            for s in sections {
                let spec = ProbeSpec {
                    interval: if s.interval_ms == 0 { DEFAULT_INTERVAL } else { Duration::from_millis(s.interval_ms) },
                    failure_threshold: if s.failure_threshold == 0 { DEFAULT_FAILURE_THRESHOLD } else { s.failure_threshold },
                    tcp: TcpProbeSpec {
                        endpoint: s.endpoint.clone(),
                        timeout: if s.timeout_ms == 0 { DEFAULT_TIMEOUT } else { Duration::from_millis(s.timeout_ms) },
                    },
                };
                let id = if s.name.is_empty() { format!("tcp:{}", s.endpoint) } else { s.name.clone() };
                safe::modify::<ProbeSpec, _, _, anyhow::Error>(&*r, &id, |p| {
                    *p = spec.clone();
                    Ok(())
                })
                .context("error updating probe spec")?;
                ids.push(id);
            }
            safe::cleanup_outputs::<ProbeSpec, _, _>(&*r, |id| ids.iter().any(|x| x == id))?;
        }
    }
}
