//! Secrets controllers: root material from machine config, SAN derivation and
//! the per-service certificate controllers built on `bastion-pki`.
//!
//! Every certificate controller waits for address and hostname readiness plus
//! a synced clock before issuing, and reissues on input changes or when half
//! of the certificate validity has elapsed.

use std::time::Duration;

use bastion_core::StateResult;
use bastion_pki::{spki_fingerprint, IssuedCertificate, LEAF_VALIDITY};
use bastion_resources::network::{NetworkStatusSpec, NETWORK_STATUS_ID};
use bastion_resources::secrets::PemCertificateAndKey;
use bastion_resources::time::{TimeStatusSpec, TIME_STATUS_ID};
use bastion_runtime::Input;
use bastion_store::{safe, Reader};
use metrics::counter;
use tracing::debug;

mod api;
mod cert_san;
mod etcd;
mod kubernetes;
mod maintenance;
mod root;
mod trusted_roots;
mod trustd;

pub use api::{ApiCertsController, LocalIssuer, NoRemoteIssuer, RemoteIssuer, SignedCertificate, IMPERSONATOR_ORG};
pub use cert_san::{CertSanController, MaintenanceCertSanController};
pub use etcd::{EtcdCertsController, EtcdSpecController};
pub use kubernetes::KubernetesDynamicCertsController;
pub use maintenance::MaintenanceCertsController;
pub use root::RootController;
pub use trusted_roots::TrustedRootsController;
pub use trustd::TrustdCertsController;

pub(crate) use cert_san::endpoint_host;

/// Certificates are reissued when half of their lifetime has passed.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(LEAF_VALIDITY.as_secs() / 2);

/// Inputs that gate issuance: network readiness and time sync.
pub(crate) fn readiness_inputs() -> Vec<Input> {
    vec![
        Input::weak_id::<NetworkStatusSpec>(NETWORK_STATUS_ID),
        Input::weak_id::<TimeStatusSpec>(TIME_STATUS_ID),
    ]
}

/// Addresses and hostname are ready and the clock is trusted.
pub(crate) fn ready_to_issue<R: Reader + ?Sized>(r: &R) -> StateResult<bool> {
    let net = safe::get_opt::<NetworkStatusSpec, _>(r, NETWORK_STATUS_ID)?;
    let time = safe::get_opt::<TimeStatusSpec, _>(r, TIME_STATUS_ID)?;
    let net_ready = net.map(|n| n.spec.address_ready && n.spec.hostname_ready).unwrap_or(false);
    Ok(net_ready && time.map(|t| t.spec.synced).unwrap_or(false))
}

pub(crate) fn pem_pair(issued: IssuedCertificate) -> PemCertificateAndKey {
    PemCertificateAndKey::new(issued.cert_pem, issued.key_pem)
}

/// Debug-logs SPKI fingerprints of freshly issued certificates.
pub(crate) fn log_issued(controller: &str, certs: &[(&str, &PemCertificateAndKey)]) {
    for (role, pair) in certs {
        counter!("certs_issued_total", 1u64, "controller" => controller.to_string(), "role" => role.to_string());
        match spki_fingerprint(&pair.crt) {
            Ok(fp) => debug!(controller, role, fingerprint = %fp, "generated new certificate"),
            Err(e) => debug!(controller, role, error = %e, "fingerprint unavailable"),
        }
    }
}
