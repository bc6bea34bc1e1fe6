#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bastion_controllers::network::{
    tcp_probe, HostnameController, LinkStatusController, NetworkStatusController, Notification, Probe,
    ProbeConfigController, ProbeController, SysfsLinkSource,
};
use bastion_resources::config::{MachineConfigSpec, ProbeSection, MACHINE_CONFIG_ID};
use bastion_resources::network::{
    HostnameStatusSpec, LinkStatusSpec, NetworkStatusSpec, ProbeSpec, ProbeStatusSpec, TcpProbeSpec, HOSTNAME_STATUS_ID,
    NETWORK_STATUS_ID,
};
use bastion_runtime::{MockClock, SystemClock};
use common::{put, start, state, wait_for, wait_gone};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn parked(clock: &MockClock) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while clock.sleepers() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("probe never parked on the clock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_reports_failure_after_threshold() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let clock = MockClock::new();
    let spec = ProbeSpec {
        interval: Duration::from_millis(10),
        failure_threshold: 3,
        tcp: TcpProbeSpec { endpoint: endpoint.clone(), timeout: Duration::from_secs(5) },
    };

    let ctx = tokio_util::sync::CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Notification>(8);
    let mut probe = Probe::new("api", spec, Arc::new(clock.clone()));
    probe.start(&ctx, tx);

    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.id, "api");
    assert!(first.status.success);

    drop(listener);
    for _ in 0..3 {
        parked(&clock).await;
        clock.advance(Duration::from_millis(10));
        parked(&clock).await;
        assert!(rx.try_recv().is_err(), "failure reported before threshold");
    }

    clock.advance(Duration::from_millis(10));
    let failed = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    assert!(!failed.status.success);
    assert!(failed.status.last_error.contains("connection refused"), "{}", failed.status.last_error);

    probe.stop().await;
}

#[tokio::test]
async fn connect_timeout_follows_the_injected_clock() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let clock = MockClock::new();

    let spec = TcpProbeSpec { endpoint: endpoint.clone(), timeout: Duration::ZERO };
    let err = tcp_probe(&spec, &clock).await.unwrap_err();
    assert_eq!(err, format!("dial tcp {endpoint}: i/o timeout"));

    // Virtual time stands still, so the budget never runs out.
    let spec = TcpProbeSpec { endpoint, timeout: Duration::from_nanos(1) };
    tcp_probe(&spec, &clock).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_config_drives_probe_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let st = state();
    let mut cfg = MachineConfigSpec::default();
    cfg.machine.probes =
        vec![ProbeSection { name: String::new(), endpoint: endpoint.clone(), interval_ms: 50, ..Default::default() }];
    put(&st, MACHINE_CONFIG_ID, cfg);

    let clock = Arc::new(SystemClock);
    let running = start(&st, vec![Box::new(ProbeConfigController), Box::new(ProbeController::new(clock))]);

    let id = format!("tcp:{endpoint}");
    let spec = wait_for::<ProbeSpec, _>(&st, &id, |_| true).await;
    assert_eq!(spec.spec.interval, Duration::from_millis(50));
    assert_eq!(spec.spec.tcp.timeout, Duration::from_secs(10));
    assert_eq!(spec.spec.failure_threshold, 3);
    wait_for::<ProbeStatusSpec, _>(&st, &id, |s| s.success).await;

    put(&st, MACHINE_CONFIG_ID, MachineConfigSpec::default());
    wait_gone::<ProbeSpec>(&st, &id).await;
    wait_gone::<ProbeStatusSpec>(&st, &id).await;

    running.stop().await;
}

fn fake_link(root: &std::path::Path, name: &str, operstate: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("ifindex"), "2\n").unwrap();
    std::fs::write(dir.join("address"), "52:54:00:12:34:56\n").unwrap();
    std::fs::write(dir.join("mtu"), "1500\n").unwrap();
    std::fs::write(dir.join("operstate"), format!("{operstate}\n")).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn network_status_follows_config_and_links() {
    let sysfs = tempfile::tempdir().unwrap();
    fake_link(sysfs.path(), "eth0", "up");
    let st = state();
    let raw = "machine:\n  network:\n    domainname: example.com\n    addresses: [10.2.1.3/24]\n";
    put(&st, MACHINE_CONFIG_ID, MachineConfigSpec::from_yaml(raw).unwrap());

    let clock = Arc::new(SystemClock);
    let links = Arc::new(SysfsLinkSource::with_root(sysfs.path(), clock.clone()));
    let running = start(
        &st,
        vec![
            Box::new(bastion_controllers::network::NodeAddressController),
            Box::new(HostnameController),
            Box::new(LinkStatusController::new(links, clock)),
            Box::new(NetworkStatusController),
        ],
    );

    let hostname = wait_for::<HostnameStatusSpec, _>(&st, HOSTNAME_STATUS_ID, |_| true).await;
    assert_eq!(hostname.spec.hostname, "bastion-10-2-1-3");
    assert_eq!(hostname.spec.fqdn(), "bastion-10-2-1-3.example.com");

    let eth0 = wait_for::<LinkStatusSpec, _>(&st, "eth0", |l| l.is_up()).await;
    assert_eq!(eth0.spec.mtu, 1500);
    wait_for::<NetworkStatusSpec, _>(&st, NETWORK_STATUS_ID, |s| {
        *s == NetworkStatusSpec { address_ready: true, connectivity_ready: true, hostname_ready: true }
    })
    .await;

    running.stop().await;
}
