use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::{parse_pem, PkiError, Result};

fn parse_cert(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| PkiError::Parse { what: "certificate", reason: e.to_string() })?;
    Ok(cert)
}

/// SHA-256 over the DER SubjectPublicKeyInfo, lowercase hex.
pub fn spki_fingerprint(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    let cert = parse_cert(&der)?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Number of certificates in a PEM bundle.
pub fn count_certificates(bundle: &str) -> usize {
    ::pem::parse_many(bundle.as_bytes())
        .map(|blocks| blocks.iter().filter(|b| b.tag() == "CERTIFICATE").count())
        .unwrap_or(0)
}

/// Decoded view of the fields controllers and tests care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
    pub digital_signature: bool,
    pub key_encipherment: bool,
    pub server_auth: bool,
    pub client_auth: bool,
}

impl CertificateInfo {
    pub fn from_pem(cert_pem: &str) -> Result<Self> {
        let der = parse_pem(cert_pem)?;
        let cert = parse_cert(&der)?;
        let subject = cert.subject();
        let mut info = CertificateInfo {
            common_name: subject.iter_common_name().next().and_then(|a| a.as_str().ok()).map(str::to_string),
            organizations: subject.iter_organization().filter_map(|a| a.as_str().ok()).map(str::to_string).collect(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca: cert.is_ca(),
            ..Default::default()
        };
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(n) => info.dns_names.push(n.to_string()),
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_bytes(raw) {
                            info.ips.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }
        if let Ok(Some(ku)) = cert.key_usage() {
            info.digital_signature = ku.value.digital_signature();
            info.key_encipherment = ku.value.key_encipherment();
        }
        if let Ok(Some(eku)) = cert.extended_key_usage() {
            info.server_auth = eku.value.server_auth;
            info.client_auth = eku.value.client_auth;
        }
        Ok(info)
    }

    /// Seconds between issuance and expiry.
    pub fn lifetime_secs(&self) -> i64 { self.not_after - self.not_before }
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(raw).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}
