//! Minimal SNTP client (RFC 4330) over tokio UDP.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bastion_runtime::{Clock, RestartBackoff};
use metrics::counter;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{NtpSyncer, SyncEvent, SyncerFactory};

pub const NTP_PORT: u16 = 123;

const PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_POLL: Duration = Duration::from_secs(64);
const MAX_POLL: Duration = Duration::from_secs(1024);
const RETRY_INITIAL: Duration = Duration::from_secs(1);
/// Offsets beyond this bump the time epoch.
const EPOCH_JUMP: Duration = Duration::from_secs(15 * 60);

/// Applies a measured clock offset.
pub trait TimeAdjuster: Send + Sync + 'static {
    fn adjust(&self, offset: chrono::Duration) -> anyhow::Result<()>;
}

/// Records offsets without touching the system clock.
#[derive(Debug, Default)]
pub struct LoggingAdjuster;

impl TimeAdjuster for LoggingAdjuster {
    fn adjust(&self, offset: chrono::Duration) -> anyhow::Result<()> {
        info!(offset_ms = offset.num_milliseconds(), "clock offset measured");
        Ok(())
    }
}

fn ntp_seconds(t: SystemTime) -> f64 {
    let unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    (unix.as_secs() + NTP_UNIX_OFFSET) as f64 + f64::from(unix.subsec_nanos()) / 1e9
}

fn encode_timestamp(t: SystemTime) -> [u8; 8] {
    let unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = (unix.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((u64::from(unix.subsec_nanos()) << 32) / 1_000_000_000) as u32;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&frac.to_be_bytes());
    out
}

fn decode_timestamp(b: &[u8]) -> f64 {
    let secs = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    let frac = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
    f64::from(secs) + f64::from(frac) / 4_294_967_296.0
}

/// Client request: LI 0, version 4, mode 3, transmit timestamp set.
pub(crate) fn request_packet(transmit: SystemTime) -> [u8; PACKET_LEN] {
    let mut p = [0u8; PACKET_LEN];
    p[0] = 0x23;
    p[40..48].copy_from_slice(&encode_timestamp(transmit));
    p
}

/// Validates a server reply to `request` and returns the clock offset in seconds.
pub(crate) fn parse_response(request: &[u8; PACKET_LEN], resp: &[u8], t1: SystemTime, t4: SystemTime) -> anyhow::Result<f64> {
    if resp.len() < PACKET_LEN {
        bail!("short response: {} bytes", resp.len());
    }
    let (leap, mode, stratum) = (resp[0] >> 6, resp[0] & 0x07, resp[1]);
    if mode != 4 {
        bail!("unexpected mode {mode}");
    }
    if leap == 3 || stratum == 0 {
        bail!("server unsynchronized (leap {leap}, stratum {stratum})");
    }
    if resp[24..32] != request[40..48] {
        bail!("originate timestamp mismatch");
    }
    let (t2, t3) = (decode_timestamp(&resp[32..40]), decode_timestamp(&resp[40..48]));
    Ok(((t2 - ntp_seconds(t1)) + (t3 - ntp_seconds(t4))) / 2.0)
}

fn server_addr_spec(server: &str) -> (String, u16) {
    if let Ok(sa) = server.parse::<SocketAddr>() {
        return (sa.ip().to_string(), sa.port());
    }
    match server.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => match p.parse() {
            Ok(port) => (h.to_string(), port),
            Err(_) => (server.to_string(), NTP_PORT),
        },
        _ => (server.trim_matches(|c| c == '[' || c == ']').to_string(), NTP_PORT),
    }
}

/// SNTP syncer. Signals `Synced` after the first good exchange and
/// `EpochChange` when the measured offset exceeds 15 minutes.
pub struct SntpSyncer {
    servers: Mutex<Vec<String>>,
    changed: Notify,
    events: mpsc::Sender<SyncEvent>,
    clock: Arc<dyn Clock>,
    adjuster: Arc<dyn TimeAdjuster>,
}

impl SntpSyncer {
    pub fn new(servers: Vec<String>, events: mpsc::Sender<SyncEvent>, clock: Arc<dyn Clock>, adjuster: Arc<dyn TimeAdjuster>) -> Self {
        Self { servers: Mutex::new(servers), changed: Notify::new(), events, clock, adjuster }
    }

    fn servers(&self) -> Vec<String> { self.servers.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    async fn query(&self, server: &str) -> anyhow::Result<f64> {
        let (host, port) = server_addr_spec(server);
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .with_context(|| format!("error resolving {server}"))?
            .next()
            .ok_or_else(|| anyhow!("no addresses for {server}"))?;
        let bind: SocketAddr = if addr.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { ([0u16; 8], 0).into() };
        let sock = UdpSocket::bind(bind).await?;
        sock.connect(addr).await?;

        let t1 = self.clock.wall();
        let req = request_packet(t1);
        let mut buf = [0u8; 96];
        let n = tokio::time::timeout(QUERY_TIMEOUT, async {
            sock.send(&req).await?;
            sock.recv(&mut buf).await
        })
        .await
        .map_err(|_| anyhow!("query to {addr} timed out"))??;
        let t4 = self.clock.wall();
        parse_response(&req, &buf[..n], t1, t4).with_context(|| format!("bad response from {addr}"))
    }

    async fn query_any(&self) -> anyhow::Result<f64> {
        let servers = self.servers();
        let mut last = anyhow!("no time servers configured");
        for s in &servers {
            match self.query(s).await {
                Ok(offset) => {
                    debug!(server = %s, offset_secs = offset, "sntp exchange");
                    return Ok(offset);
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[async_trait]
impl NtpSyncer for SntpSyncer {
    async fn run(&self, ctx: CancellationToken) {
        let mut poll = MIN_POLL;
        let mut retry = RestartBackoff::new(RETRY_INITIAL, MAX_POLL);
        let mut synced = false;
        loop {
            let res = tokio::select! {
                _ = ctx.cancelled() => return,
                res = self.query_any() => res,
            };
            let wait = match res {
                Ok(offset) => {
                    counter!("sntp_queries_total", 1u64, "result" => "success");
                    retry.reset();
                    let delta = chrono::Duration::nanoseconds((offset * 1e9) as i64);
                    if let Err(e) = self.adjuster.adjust(delta) {
                        warn!(error = %format!("{e:#}"), "clock adjustment failed");
                    }
                    if offset.abs() > EPOCH_JUMP.as_secs_f64() {
                        let _ = self.events.send(SyncEvent::EpochChange).await;
                    }
                    if !synced {
                        synced = true;
                        let _ = self.events.send(SyncEvent::Synced).await;
                    }
                    let wait = poll;
                    poll = (poll * 2).min(MAX_POLL);
                    wait
                }
                Err(e) => {
                    counter!("sntp_queries_total", 1u64, "result" => "failure");
                    let wait = retry.next_delay();
                    warn!(error = %format!("{e:#}"), retry_ms = wait.as_millis() as u64, "time query failed");
                    wait
                }
            };
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = self.clock.sleep(wait) => {}
                _ = self.changed.notified() => poll = MIN_POLL,
            }
        }
    }

    fn set_time_servers(&self, servers: Vec<String>) {
        let mut cur = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        if *cur != servers {
            *cur = servers;
            drop(cur);
            self.changed.notify_one();
        }
    }
}

/// Creates [`SntpSyncer`]s sharing one clock and adjuster.
pub struct SntpFactory {
    clock: Arc<dyn Clock>,
    adjuster: Arc<dyn TimeAdjuster>,
}

impl SntpFactory {
    pub fn new(clock: Arc<dyn Clock>, adjuster: Arc<dyn TimeAdjuster>) -> Self { Self { clock, adjuster } }
}

impl SyncerFactory for SntpFactory {
    fn create(&self, servers: Vec<String>, events: mpsc::Sender<SyncEvent>) -> Arc<dyn NtpSyncer> {
        Arc::new(SntpSyncer::new(servers, events, Arc::clone(&self.clock), Arc::clone(&self.adjuster)))
    }
}
