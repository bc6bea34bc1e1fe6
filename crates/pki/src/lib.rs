//! Bastion PKI: certificate authorities, leaf issuance and CSR signing.
//!
//! Keys never leave the side that generated them: leaf issuance mints a fresh
//! key pair per certificate, and CSR signing only sees the requester's public key.

#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

mod files;
mod inspect;

pub use files::{trust_bundle, write_pem_files};
pub use inspect::{count_certificates, spki_fingerprint, CertificateInfo};

/// Validity of issued leaf certificates.
pub const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Validity of generated CAs.
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),
    #[error("invalid DNS name {0:?}")]
    InvalidName(String),
    #[error("CA key is missing")]
    MissingKey,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PkiError>;

fn parse_err(what: &'static str) -> impl FnOnce(rcgen::Error) -> PkiError {
    move |e| PkiError::Parse { what, reason: e.to_string() }
}

/// PEM contents of the first block.
pub fn parse_pem(data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(data.as_bytes()).map_err(|e| PkiError::Parse { what: "PEM", reason: e.to_string() })?;
    Ok(block.contents().to_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKeyUsage {
    ServerAuth,
    ClientAuth,
}

/// Subject, SANs, validity and usages of a certificate to issue.
#[derive(Debug, Clone)]
pub struct LeafTemplate {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
    pub issued_at: SystemTime,
    pub validity: Duration,
    pub key_usages: Vec<KeyUsage>,
    pub ext_key_usages: Vec<ExtKeyUsage>,
}

impl LeafTemplate {
    fn base(common_name: &str, key_usages: Vec<KeyUsage>, ext_key_usages: Vec<ExtKeyUsage>) -> Self {
        Self {
            common_name: common_name.to_string(),
            organizations: Vec::new(),
            dns_names: Vec::new(),
            ips: Vec::new(),
            issued_at: SystemTime::now(),
            validity: LEAF_VALIDITY,
            key_usages,
            ext_key_usages,
        }
    }

    pub fn server(common_name: &str) -> Self {
        Self::base(common_name, vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment], vec![ExtKeyUsage::ServerAuth])
    }

    pub fn client(common_name: &str) -> Self {
        Self::base(common_name, vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment], vec![ExtKeyUsage::ClientAuth])
    }

    /// Server and client auth, for mutually authenticated peers.
    pub fn peer(common_name: &str) -> Self {
        Self::base(
            common_name,
            vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            vec![ExtKeyUsage::ServerAuth, ExtKeyUsage::ClientAuth],
        )
    }

    pub fn with_key_usages(mut self, usages: Vec<KeyUsage>) -> Self {
        self.key_usages = usages;
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organizations.push(org.into());
        self
    }

    pub fn with_dns_names(mut self, names: &[String]) -> Self {
        self.dns_names.extend(names.iter().cloned());
        self
    }

    pub fn with_ips(mut self, ips: &[IpAddr]) -> Self {
        self.ips.extend(ips.iter().copied());
        self
    }

    /// Validity window starts at `at`; callers pass their clock's wall time.
    pub fn issued_at(mut self, at: SystemTime) -> Self {
        self.issued_at = at;
        self
    }

    pub fn valid_for(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(self.common_name.clone()));
        for org in &self.organizations {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        dn
    }

    fn subject_alt_names(&self) -> Result<Vec<SanType>> {
        let mut sans = Vec::with_capacity(self.dns_names.len() + self.ips.len());
        for name in &self.dns_names {
            let ia5 = Ia5String::try_from(name.clone()).map_err(|_| PkiError::InvalidName(name.clone()))?;
            sans.push(SanType::DnsName(ia5));
        }
        sans.extend(self.ips.iter().map(|ip| SanType::IpAddress(*ip)));
        Ok(sans)
    }

    /// Applies validity and usages, leaving subject and SANs untouched.
    fn apply_usages(&self, params: &mut CertificateParams) {
        let not_before = ::time::OffsetDateTime::from(self.issued_at);
        params.not_before = not_before;
        params.not_after = not_before + self.validity;
        params.is_ca = IsCa::NoCa;
        params.key_usages = self
            .key_usages
            .iter()
            .map(|u| match u {
                KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
                KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
            })
            .collect();
        params.extended_key_usages = self
            .ext_key_usages
            .iter()
            .map(|u| match u {
                ExtKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
                ExtKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
            })
            .collect();
    }

    fn params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.distinguished_name();
        params.subject_alt_names = self.subject_alt_names()?;
        self.apply_usages(&mut params);
        Ok(params)
    }
}

/// PEM certificate with its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// CA material. The key may be absent when the CA is only used for trust.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: Option<String>,
}

impl CertificateAuthority {
    /// Self-signed CA with a fresh key.
    pub fn generate(common_name: &str, organization: &str, validity: Duration) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if !common_name.is_empty() {
            dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        }
        dn.push(DnType::OrganizationName, DnValue::Utf8String(organization.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + validity;

        let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let cert = params.self_signed(&key).map_err(|e| PkiError::Generation(e.to_string()))?;
        Ok(Self { cert_pem: cert.pem(), key_pem: Some(key.serialize_pem()) })
    }

    /// Validates both PEM blocks up front.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        parse_pem(cert_pem)?;
        KeyPair::from_pem(key_pem).map_err(parse_err("CA key"))?;
        Ok(Self { cert_pem: cert_pem.to_string(), key_pem: Some(key_pem.to_string()) })
    }

    pub fn cert_pem(&self) -> &str { &self.cert_pem }
    pub fn key_pem(&self) -> Option<&str> { self.key_pem.as_deref() }

    fn signing_key(&self) -> Result<KeyPair> {
        let key_pem = self.key_pem.as_deref().ok_or(PkiError::MissingKey)?;
        KeyPair::from_pem(key_pem).map_err(parse_err("CA key"))
    }

    /// Mints a new key pair and a certificate for it.
    pub fn issue(&self, template: &LeafTemplate) -> Result<IssuedCertificate> {
        let params = template.params()?;
        let ca_key = self.signing_key()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(parse_err("CA certificate"))?;
        let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let cert = params.signed_by(&key, &issuer).map_err(|e| PkiError::Generation(e.to_string()))?;
        Ok(IssuedCertificate { cert_pem: cert.pem(), key_pem: key.serialize_pem() })
    }

    /// Signs a CSR keeping its subject and SANs; validity and usages come from `usages`.
    pub fn sign_csr(&self, csr_pem: &str, usages: &LeafTemplate) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
        usages.apply_usages(&mut csr.params);
        let ca_key = self.signing_key()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(parse_err("CA certificate"))?;
        let cert = csr.signed_by(&issuer).map_err(|e| PkiError::Generation(e.to_string()))?;
        Ok(cert.pem())
    }
}

/// Locally generated key with the CSR to send to a remote issuer.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub csr_pem: String,
    pub key_pem: String,
}

impl CertificateRequest {
    pub fn new(template: &LeafTemplate) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = template.distinguished_name();
        params.subject_alt_names = template.subject_alt_names()?;
        let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let csr = params.serialize_request(&key).map_err(|e| PkiError::Generation(e.to_string()))?;
        let csr_pem = csr.pem().map_err(|e| PkiError::Generation(e.to_string()))?;
        Ok(Self { csr_pem, key_pem: key.serialize_pem() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_without_key_cannot_issue() {
        let ca = CertificateAuthority::generate("", "bastion", CA_VALIDITY).unwrap();
        let trust_only = CertificateAuthority { cert_pem: ca.cert_pem().to_string(), key_pem: None };
        assert!(matches!(trust_only.issue(&LeafTemplate::server("x")), Err(PkiError::MissingKey)));
    }

    #[test]
    fn rejects_garbage_pem() {
        assert!(CertificateAuthority::from_pem("nope", "nope").is_err());
    }
}
