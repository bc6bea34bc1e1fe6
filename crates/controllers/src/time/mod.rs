//! Time sync: drives an NTP syncer subordinate and publishes `TimeStatus`.
//!
//! `synced` is sticky within one controller run. Disabling sync marks the
//! clock synced, re-enabling resets it until the new syncer reports. A
//! boot-timeout deadline measured from controller construction declares the
//! clock synced when no syncer managed to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::config::{MachineConfigSpec, DEFAULT_BOOT_TIMEOUT, MACHINE_CONFIG_ID};
use bastion_resources::network::{TimeServerStatusSpec, TIME_SERVER_STATUS_ID};
use bastion_resources::runtime::{DevicesStatusSpec, DEVICES_STATUS_ID};
use bastion_resources::time::{TimeStatusSpec, TIME_STATUS_ID};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Mode;

mod sntp;

pub use sntp::{LoggingAdjuster, SntpFactory, SntpSyncer, TimeAdjuster, NTP_PORT};

const EVENT_BUFFER: usize = 8;

/// Signals raised by a syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// First successful exchange.
    Synced,
    /// The clock jumped far enough that time-derived artifacts are stale.
    EpochChange,
}

/// NTP client subordinate to [`SyncController`].
#[async_trait]
pub trait NtpSyncer: Send + Sync + 'static {
    /// Runs until `ctx` is cancelled.
    async fn run(&self, ctx: CancellationToken);
    fn set_time_servers(&self, servers: Vec<String>);
}

pub trait SyncerFactory: Send + Sync + 'static {
    fn create(&self, servers: Vec<String>, events: mpsc::Sender<SyncEvent>) -> Arc<dyn NtpSyncer>;
}

struct Running {
    syncer: Arc<dyn NtpSyncer>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    fn spawn(syncer: Arc<dyn NtpSyncer>, ctx: &CancellationToken) -> Self {
        let cancel = ctx.child_token();
        let task = tokio::spawn({
            let (syncer, cancel) = (Arc::clone(&syncer), cancel.clone());
            async move { syncer.run(cancel).await }
        });
        Self { syncer, cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub struct SyncController {
    clock: Arc<dyn Clock>,
    mode: Mode,
    factory: Arc<dyn SyncerFactory>,
    boot_time: Instant,
}

impl SyncController {
    pub fn new(clock: Arc<dyn Clock>, mode: Mode, factory: Arc<dyn SyncerFactory>) -> Self {
        let boot_time = clock.now();
        Self { clock, mode, factory, boot_time }
    }

    fn boot_timer(&self, synced: bool, timeout: Duration) -> BoxFuture<'static, ()> {
        if synced || timeout.is_zero() {
            return futures::future::pending().boxed();
        }
        self.clock.sleep_until(self.boot_time + timeout)
    }

    async fn reconcile_loop(
        &self,
        ctx: &CancellationToken,
        r: &mut ControllerHandle,
        running: &mut Option<Running>,
    ) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut status = TimeStatusSpec::default();
        let mut boot_timeout = DEFAULT_BOOT_TIMEOUT;

        loop {
            let boot_timer = self.boot_timer(status.synced, boot_timeout);
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                ev = rx.recv() => match ev {
                    Some(SyncEvent::Synced) if !status.synced => {
                        info!("time synced");
                        status.synced = true;
                    }
                    Some(SyncEvent::EpochChange) => {
                        status.epoch += 1;
                        info!(epoch = status.epoch, "time epoch changed");
                    }
                    _ => {}
                },
                _ = boot_timer => {
                    warn!(timeout_secs = boot_timeout.as_secs(), "boot time sync timeout exceeded; assuming time is synced");
                    status.synced = true;
                }
            }

            if !self.mode.is_container() {
                let ready = safe::get_opt::<DevicesStatusSpec, _>(&*r, DEVICES_STATUS_ID)?.map(|d| d.spec.ready).unwrap_or(false);
                if !ready {
                    continue;
                }
            }
            let Some(servers) = safe::get_opt::<TimeServerStatusSpec, _>(&*r, TIME_SERVER_STATUS_ID)? else { continue };
            let servers = servers.spec.ntp_servers;
            let cfg = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.machine.time)
                .unwrap_or_default();
            boot_timeout = cfg.boot_timeout();

            status.sync_disabled = cfg.disabled || self.mode.is_container();
            if status.sync_disabled {
                if let Some(s) = running.take() {
                    s.stop().await;
                    info!("time sync disabled");
                }
                status.synced = true;
            } else if running.is_none() {
                let syncer = self.factory.create(servers.clone(), tx.clone());
                *running = Some(Running::spawn(syncer, ctx));
                status.synced = false;
                debug!(servers = ?servers, "time syncer started");
            }
            if let Some(s) = running.as_ref() {
                s.syncer.set_time_servers(servers);
            }

            safe::modify::<TimeStatusSpec, _, _, anyhow::Error>(&*r, TIME_STATUS_ID, |spec| {
                *spec = status.clone();
                Ok(())
            })
            .context("error updating time status")?;
        }
    }
}

#[async_trait]
impl Controller for SyncController {
    fn name(&self) -> &str { "time.SyncController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<DevicesStatusSpec>(DEVICES_STATUS_ID),
            Input::weak_id::<TimeServerStatusSpec>(TIME_SERVER_STATUS_ID),
            Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<TimeStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut running = None;
        let res = self.reconcile_loop(&ctx, r, &mut running).await;
        if let Some(s) = running.take() {
            s.stop().await;
        }
        res
    }
}
