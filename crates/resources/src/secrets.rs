//! Secret material: roots (CAs), derived SANs and issued certificates.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub const CERT_SAN_API_ID: &str = "api";
pub const CERT_SAN_KUBERNETES_ID: &str = "k8s";
pub const CERT_SAN_MAINTENANCE_ID: &str = "maintenance";
pub const OS_ROOT_ID: &str = "os";
pub const KUBERNETES_ROOT_ID: &str = "k8s";
pub const ETCD_ROOT_ID: &str = "etcd";
pub const MAINTENANCE_ROOT_ID: &str = "maintenance";
pub const API_CERTS_ID: &str = "api";
pub const TRUSTD_CERTS_ID: &str = "trustd";
pub const MAINTENANCE_CERTS_ID: &str = "maintenance";
pub const KUBERNETES_DYNAMIC_CERTS_ID: &str = "k8s-certs";
pub const ETCD_CERTS_ID: &str = "etcd";
pub const ENCRYPTION_SALT_ID: &str = "encryption-salt";
pub const TRUSTED_ROOTS_ID: &str = "trusted-roots";

/// PEM-encoded certificate with an optional key (empty when only the cert is shared).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PemCertificateAndKey {
    pub crt: String,
    pub key: String,
}

impl PemCertificateAndKey {
    pub fn new(crt: impl Into<String>, key: impl Into<String>) -> Self { Self { crt: crt.into(), key: key.into() } }
    pub fn cert_only(crt: impl Into<String>) -> Self { Self { crt: crt.into(), key: String::new() } }
    pub fn is_empty(&self) -> bool { self.crt.is_empty() }
    pub fn has_key(&self) -> bool { !self.key.is_empty() }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OsRootSpec {
    pub issuing_ca: PemCertificateAndKey,
    pub accepted_cas: Vec<String>,
    pub cert_san_ips: Vec<IpAddr>,
    pub cert_san_dns_names: Vec<String>,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KubernetesRootSpec {
    pub name: String,
    pub endpoint: String,
    pub local_endpoint: String,
    pub cert_sans: Vec<String>,
    pub api_server_ips: Vec<IpAddr>,
    pub dns_domain: String,
    pub issuing_ca: PemCertificateAndKey,
    pub accepted_cas: Vec<String>,
    pub aggregator_ca: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EtcdRootSpec {
    pub etcd_ca: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceRootSpec {
    pub ca: PemCertificateAndKey,
}

/// Subject alternative names for one certificate purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertSanSpec {
    pub ips: Vec<IpAddr>,
    pub dns_names: Vec<String>,
    pub fqdn: String,
}

impl CertSanSpec {
    pub fn reset(&mut self) {
        self.ips.clear();
        self.dns_names.clear();
        self.fqdn.clear();
    }

    /// Appends names skipping empties and duplicates.
    pub fn append_dns_names<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for n in names {
            let n = n.as_ref();
            if n.is_empty() || self.dns_names.iter().any(|x| x == n) { continue; }
            self.dns_names.push(n.to_string());
        }
    }

    /// Appends IPs skipping unspecified and duplicate addresses.
    pub fn append_ips<I: IntoIterator<Item = IpAddr>>(&mut self, ips: I) {
        for ip in ips {
            if ip.is_unspecified() || self.ips.contains(&ip) { continue; }
            self.ips.push(ip);
        }
    }

    /// DNS names lexicographically, IPs by binary value (v4 before v6).
    pub fn sort(&mut self) {
        self.dns_names.sort();
        self.ips.sort();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApiCertsSpec {
    pub accepted_cas: Vec<String>,
    pub server: PemCertificateAndKey,
    pub client: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrustdCertsSpec {
    pub accepted_cas: Vec<String>,
    pub server: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceServiceCertsSpec {
    /// CA certificate only; the key never leaves the root.
    pub ca: PemCertificateAndKey,
    pub server: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KubernetesDynamicCertsSpec {
    pub api_server: PemCertificateAndKey,
    pub api_server_kubelet_client: PemCertificateAndKey,
    pub front_proxy: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EtcdCertsSpec {
    pub server: PemCertificateAndKey,
    pub peer: PemCertificateAndKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncryptionSaltSpec {
    pub disk_salt: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrustedRootsSpec {
    /// Concatenated PEM bundle as written to disk.
    pub bundle: String,
    pub certificates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_san_dedup_and_sort() {
        let mut san = CertSanSpec::default();
        san.append_dns_names(["foo", "", "example.com", "foo"]);
        san.append_ips(["10.4.3.2".parse().unwrap(), "10.2.1.3".parse().unwrap(), "0.0.0.0".parse().unwrap()]);
        san.append_ips(["10.2.1.3".parse().unwrap(), "::1".parse().unwrap()]);
        san.sort();
        assert_eq!(san.dns_names, vec!["example.com", "foo"]);
        let ips: Vec<String> = san.ips.iter().map(|i| i.to_string()).collect();
        assert_eq!(ips, vec!["10.2.1.3", "10.4.3.2", "::1"]);
    }
}
