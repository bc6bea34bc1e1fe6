//! Bastion machine controllers.
//!
//! Each controller is a [`bastion_runtime::Controller`]; side effects go
//! through injected ports ([`Ports`]) so tests can swap the clock, link source,
//! CSR issuer, NTP syncer and volume mounter.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bastion_runtime::{Clock, Runtime, RuntimeError};

pub mod block;
mod fsutil;
pub mod k8s;
pub mod network;
pub mod secrets;
pub mod time;

/// Where the daemon runs. Container mode has no devices to wait for and never
/// touches the clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Metal,
    Container,
}

impl Mode {
    pub fn is_container(&self) -> bool { *self == Mode::Container }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metal" => Ok(Mode::Metal),
            "container" => Ok(Mode::Container),
            other => Err(format!("unknown mode {other:?} (expected metal or container)")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Metal => "metal",
            Mode::Container => "container",
        })
    }
}

/// External collaborators of the controller set.
#[derive(Clone)]
pub struct Ports {
    pub clock: Arc<dyn Clock>,
    pub mode: Mode,
    pub links: Arc<dyn network::LinkSource>,
    pub issuer: Arc<dyn secrets::RemoteIssuer>,
    pub syncers: Arc<dyn time::SyncerFactory>,
    pub mounter: Arc<dyn block::Mounter>,
    /// PEM bundle that user roots are appended to.
    pub default_roots: String,
    pub trusted_roots_path: Option<PathBuf>,
}

impl Ports {
    /// Production ports rooted at `state_dir`.
    pub fn new(clock: Arc<dyn Clock>, mode: Mode, state_dir: &Path) -> Self {
        Self {
            links: Arc::new(network::SysfsLinkSource::new(Arc::clone(&clock))),
            issuer: Arc::new(secrets::NoRemoteIssuer),
            syncers: Arc::new(time::SntpFactory::new(Arc::clone(&clock), Arc::new(time::LoggingAdjuster))),
            mounter: Arc::new(block::DirMounter::new(state_dir.join("volumes"))),
            default_roots: String::new(),
            trusted_roots_path: Some(state_dir.join("ca-certificates.crt")),
            clock,
            mode,
        }
    }
}

/// Registers every controller of this crate.
pub fn register_all(rt: &mut Runtime, ports: &Ports) -> Result<(), RuntimeError> {
    let clock = || Arc::clone(&ports.clock);

    rt.register(secrets::RootController::default())?;
    rt.register(secrets::TrustedRootsController::new(ports.default_roots.clone(), ports.trusted_roots_path.clone()))?;
    rt.register(secrets::CertSanController::default())?;
    rt.register(secrets::MaintenanceCertSanController::default())?;
    rt.register(secrets::ApiCertsController::new(clock(), Arc::clone(&ports.issuer)))?;
    rt.register(secrets::TrustdCertsController::new(clock()))?;
    rt.register(secrets::MaintenanceCertsController::new(clock()))?;
    rt.register(secrets::KubernetesDynamicCertsController::new(clock()))?;
    rt.register(secrets::EtcdSpecController)?;
    rt.register(secrets::EtcdCertsController::new(clock()))?;

    rt.register(network::LinkStatusController::new(Arc::clone(&ports.links), clock()))?;
    rt.register(network::NodeAddressController)?;
    rt.register(network::HostnameController)?;
    rt.register(network::NetworkStatusController)?;
    rt.register(network::TimeServerController)?;
    rt.register(network::ProbeConfigController)?;
    rt.register(network::ProbeController::new(clock()))?;

    rt.register(k8s::ControlPlaneEndpointController::new(clock()))?;
    rt.register(time::SyncController::new(clock(), ports.mode, Arc::clone(&ports.syncers)))?;

    rt.register(block::DevicesStatusController)?;
    rt.register(block::VolumeMountController::new(Arc::clone(&ports.mounter)))?;
    rt.register(block::EncryptionSaltController)?;
    Ok(())
}
