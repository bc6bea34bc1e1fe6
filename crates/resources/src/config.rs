//! Machine configuration shapes consumed by controllers.
//!
//! Every option a controller reads is a named field; unknown keys are rejected
//! at parse time.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::IpPrefix;
use crate::secrets::PemCertificateAndKey;

/// Id of the singleton machine config resource.
pub const MACHINE_CONFIG_ID: &str = "v1alpha1";
/// Id of the singleton machine type resource.
pub const MACHINE_TYPE_ID: &str = "machine-type";

pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MachineConfigSpec {
    pub machine: MachineSection,
    pub cluster: ClusterSection,
}

impl MachineConfigSpec {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> { serde_yaml::from_str(raw) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MachineSection {
    #[serde(rename = "type")]
    pub machine_type: MachineType,
    pub token: String,
    pub ca: PemCertificateAndKey,
    pub cert_sans: Vec<String>,
    pub network: NetworkSection,
    pub time: TimeSection,
    /// Extra PEM blocks appended to the trusted roots bundle.
    pub trusted_roots: Vec<String>,
    pub probes: Vec<ProbeSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkSection {
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub addresses: Vec<IpPrefix>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeSection {
    pub disabled: bool,
    pub servers: Vec<String>,
    /// Zero disables the boot-time safety net.
    pub boot_timeout_seconds: Option<u64>,
}

impl TimeSection {
    pub fn boot_timeout(&self) -> Duration {
        self.boot_timeout_seconds.map(Duration::from_secs).unwrap_or(DEFAULT_BOOT_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ProbeSection {
    pub name: String,
    pub endpoint: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterSection {
    pub name: String,
    /// Control plane endpoint URL, e.g. `https://cp.example.com:6443`.
    pub endpoint: String,
    pub dns_domain: String,
    pub api_server_cert_sans: Vec<String>,
    pub api_server_ips: Vec<IpAddr>,
    pub ca: PemCertificateAndKey,
    pub aggregator_ca: PemCertificateAndKey,
    pub etcd_ca: PemCertificateAndKey,
}

impl ClusterSection {
    pub fn dns_domain(&self) -> &str {
        if self.dns_domain.is_empty() { DEFAULT_DNS_DOMAIN } else { &self.dns_domain }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    #[default]
    Unknown,
    Init,
    ControlPlane,
    Worker,
}

impl MachineType {
    pub fn is_control_plane(&self) -> bool { matches!(self, MachineType::Init | MachineType::ControlPlane) }
}

impl std::fmt::Display for MachineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineType::Unknown => "unknown",
            MachineType::Init => "init",
            MachineType::ControlPlane => "controlplane",
            MachineType::Worker => "worker",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineTypeSpec {
    pub machine_type: MachineType,
}
