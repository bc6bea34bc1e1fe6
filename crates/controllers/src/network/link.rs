//! Link status from a pluggable link source.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::network::{LinkStatusSpec, OperState};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, RateLimitedTrigger, Ticker, Trigger};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SYSFS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Source of link state. `watch` calls `trigger` on every observed change
/// until `ctx` is cancelled.
#[async_trait]
pub trait LinkSource: Send + Sync + 'static {
    fn links(&self) -> anyhow::Result<BTreeMap<String, LinkStatusSpec>>;
    async fn watch(&self, ctx: CancellationToken, trigger: RateLimitedTrigger);
}

/// Reads `/sys/class/net` and polls it for changes.
pub struct SysfsLinkSource {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SysfsLinkSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self::with_root("/sys/class/net", clock) }

    pub fn with_root(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self { Self { root: root.into(), clock } }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name)).ok().map(|s| s.trim().to_string())
}

fn oper_state(s: Option<&str>) -> OperState {
    match s {
        Some("up") => OperState::Up,
        Some("down") | Some("lowerlayerdown") | Some("notpresent") => OperState::Down,
        _ => OperState::Unknown,
    }
}

#[async_trait]
impl LinkSource for SysfsLinkSource {
    fn links(&self) -> anyhow::Result<BTreeMap<String, LinkStatusSpec>> {
        let mut out = BTreeMap::new();
        let entries = fs::read_dir(&self.root).with_context(|| format!("error reading {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            let spec = LinkStatusSpec {
                index: read_attr(&dir, "ifindex").and_then(|s| s.parse().ok()).unwrap_or_default(),
                hardware_addr: read_attr(&dir, "address").unwrap_or_default(),
                mtu: read_attr(&dir, "mtu").and_then(|s| s.parse().ok()).unwrap_or_default(),
                oper_state: oper_state(read_attr(&dir, "operstate").as_deref()),
            };
            out.insert(name, spec);
        }
        Ok(out)
    }

    async fn watch(&self, ctx: CancellationToken, trigger: RateLimitedTrigger) {
        let mut ticker = Ticker::new(Arc::clone(&self.clock), SYSFS_POLL_INTERVAL);
        let mut last = self.links().ok();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let cur = self.links().ok();
            if cur != last {
                trigger.queue_reconcile();
                last = cur;
            }
        }
    }
}

/// Mirrors the link source into `LinkStatus` resources, one per link name.
pub struct LinkStatusController {
    source: Arc<dyn LinkSource>,
    clock: Arc<dyn Clock>,
}

impl LinkStatusController {
    pub fn new(source: Arc<dyn LinkSource>, clock: Arc<dyn Clock>) -> Self { Self { source, clock } }

    fn sync(&self, r: &ControllerHandle) -> anyhow::Result<()> {
        let links = self.source.links()?;
        for (name, link) in &links {
            safe::modify::<LinkStatusSpec, _, _, anyhow::Error>(r, name, |spec| {
                *spec = link.clone();
                Ok(())
            })
            .context("error modifying link status")?;
        }
        safe::cleanup_outputs::<LinkStatusSpec, _, _>(r, |id| links.contains_key(id))?;
        debug!(links = links.len(), "link status refreshed");
        Ok(())
    }
}

#[async_trait]
impl Controller for LinkStatusController {
    fn name(&self) -> &str { "network.LinkStatusController" }

    fn inputs(&self) -> Vec<Input> { Vec::new() }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<LinkStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let watch_ctx = ctx.child_token();
        let (trigger, forwarder) = RateLimitedTrigger::new(watch_ctx.clone(), r.trigger(), Arc::clone(&self.clock));
        let source = Arc::clone(&self.source);
        let watcher = tokio::spawn({
            let watch_ctx = watch_ctx.clone();
            async move { source.watch(watch_ctx, trigger).await }
        });

        let res = async {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = r.next_event() => {}
                }
                if let Err(e) = self.sync(r) {
                    warn!(error = %format!("{e:#}"), "link refresh failed");
                    return Err(e);
                }
            }
        }
        .await;

        watch_ctx.cancel();
        let _ = watcher.await;
        let _ = forwarder.await;
        res
    }
}
