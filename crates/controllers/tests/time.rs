#![forbid(unsafe_code)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bastion_controllers::time::{NtpSyncer, SyncController, SyncEvent, SyncerFactory};
use bastion_controllers::Mode;
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::network::{TimeServerStatusSpec, TIME_SERVER_STATUS_ID};
use bastion_resources::runtime::{DevicesStatusSpec, DEVICES_STATUS_ID};
use bastion_resources::time::{TimeStatusSpec, TIME_STATUS_ID};
use bastion_runtime::MockClock;
use common::{put, start, state, wait_for};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeSyncer {
    servers: Mutex<Vec<String>>,
}

#[async_trait]
impl NtpSyncer for FakeSyncer {
    async fn run(&self, ctx: CancellationToken) { ctx.cancelled().await }

    fn set_time_servers(&self, servers: Vec<String>) { *self.servers.lock().unwrap() = servers; }
}

#[derive(Default)]
struct FakeFactory {
    created: Mutex<Vec<Arc<FakeSyncer>>>,
    events: Mutex<Option<mpsc::Sender<SyncEvent>>>,
}

impl FakeFactory {
    fn created(&self) -> usize { self.created.lock().unwrap().len() }

    async fn send(&self, ev: SyncEvent) {
        let tx = self.events.lock().unwrap().clone().expect("no syncer created");
        tx.send(ev).await.unwrap();
    }
}

impl SyncerFactory for FakeFactory {
    fn create(&self, servers: Vec<String>, events: mpsc::Sender<SyncEvent>) -> Arc<dyn NtpSyncer> {
        let syncer = Arc::new(FakeSyncer { servers: Mutex::new(servers) });
        self.created.lock().unwrap().push(Arc::clone(&syncer));
        *self.events.lock().unwrap() = Some(events);
        syncer
    }
}

fn config(disabled: bool, boot_timeout_seconds: u64) -> MachineConfigSpec {
    let mut cfg = MachineConfigSpec::default();
    cfg.machine.time.disabled = disabled;
    cfg.machine.time.boot_timeout_seconds = Some(boot_timeout_seconds);
    cfg
}

fn seed(st: &bastion_store::State, cfg: MachineConfigSpec) {
    put(st, DEVICES_STATUS_ID, DevicesStatusSpec { ready: true });
    put(st, TIME_SERVER_STATUS_ID, TimeServerStatusSpec { ntp_servers: vec!["pool.ntp.org".into()] });
    put(st, MACHINE_CONFIG_ID, cfg);
}

async fn parked(clock: &MockClock) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while clock.sleepers() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("boot timer never armed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn boot_timeout_marks_time_synced() {
    let st = state();
    let clock = MockClock::new();
    let factory = Arc::new(FakeFactory::default());
    seed(&st, config(false, 5));
    let running = start(&st, vec![Box::new(SyncController::new(Arc::new(clock.clone()), Mode::Metal, factory.clone()))]);

    let status = wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |_| true).await;
    assert!(!status.spec.synced);
    assert_eq!(factory.created(), 1);

    parked(&clock).await;
    clock.advance(Duration::from_secs(5));
    let status = wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |s| s.synced).await;
    assert_eq!(status.spec, TimeStatusSpec { synced: true, epoch: 0, sync_disabled: false });

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metal_mode_waits_for_devices() {
    let st = state();
    let factory = Arc::new(FakeFactory::default());
    put(&st, TIME_SERVER_STATUS_ID, TimeServerStatusSpec { ntp_servers: vec!["pool.ntp.org".into()] });
    put(&st, MACHINE_CONFIG_ID, config(false, 0));
    let clock = MockClock::new();
    let running = start(&st, vec![Box::new(SyncController::new(Arc::new(clock), Mode::Metal, factory.clone()))]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bastion_store::safe::get_opt::<TimeStatusSpec, _>(&*st, TIME_STATUS_ID).unwrap().is_none());
    assert_eq!(factory.created(), 0);

    put(&st, DEVICES_STATUS_ID, DevicesStatusSpec { ready: true });
    wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |s| !s.synced && !s.sync_disabled).await;
    assert_eq!(factory.created(), 1);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn container_mode_disables_sync() {
    let st = state();
    let factory = Arc::new(FakeFactory::default());
    put(&st, TIME_SERVER_STATUS_ID, TimeServerStatusSpec { ntp_servers: vec!["pool.ntp.org".into()] });
    let running = start(&st, vec![Box::new(SyncController::new(Arc::new(MockClock::new()), Mode::Container, factory.clone()))]);

    let status = wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |_| true).await;
    assert!(status.spec.synced && status.spec.sync_disabled);
    assert_eq!(factory.created(), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn syncer_events_drive_status() {
    let st = state();
    let factory = Arc::new(FakeFactory::default());
    seed(&st, config(false, 0));
    let running = start(&st, vec![Box::new(SyncController::new(Arc::new(MockClock::new()), Mode::Metal, factory.clone()))]);

    wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |s| !s.synced).await;
    factory.send(SyncEvent::EpochChange).await;
    factory.send(SyncEvent::Synced).await;
    let status = wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |s| s.synced).await;
    assert_eq!(status.spec.epoch, 1);

    put(&st, TIME_SERVER_STATUS_ID, TimeServerStatusSpec { ntp_servers: vec!["time.example.com".into()] });
    let syncer = Arc::clone(&factory.created.lock().unwrap()[0]);
    tokio::time::timeout(Duration::from_secs(10), async {
        while *syncer.servers.lock().unwrap() != ["time.example.com"] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(factory.created(), 1);

    put(&st, MACHINE_CONFIG_ID, config(true, 0));
    let status = wait_for::<TimeStatusSpec, _>(&st, TIME_STATUS_ID, |s| s.sync_disabled).await;
    assert!(status.spec.synced);

    running.stop().await;
}
