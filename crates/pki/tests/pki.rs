#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use bastion_pki::{
    count_certificates, spki_fingerprint, trust_bundle, write_pem_files, CertificateAuthority, CertificateInfo,
    CertificateRequest, LeafTemplate, CA_VALIDITY, LEAF_VALIDITY,
};

fn ca() -> CertificateAuthority { CertificateAuthority::generate("", "bastion", CA_VALIDITY).unwrap() }

#[test]
fn generated_ca_is_a_ca() {
    let ca = ca();
    let info = CertificateInfo::from_pem(ca.cert_pem()).unwrap();
    assert!(info.is_ca);
    assert_eq!(info.organizations, vec!["bastion".to_string()]);
    let again = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem().unwrap()).unwrap();
    assert_eq!(again.cert_pem(), ca.cert_pem());
}

#[test]
fn issued_server_cert_carries_sans_and_usages() {
    let ca = ca();
    let ips: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "127.0.0.1".parse().unwrap()];
    let template = LeafTemplate::server("apid")
        .with_dns_names(&["node-1".to_string(), "node-1.example.com".to_string()])
        .with_ips(&ips);
    let issued = ca.issue(&template).unwrap();
    let info = CertificateInfo::from_pem(&issued.cert_pem).unwrap();
    assert_eq!(info.common_name.as_deref(), Some("apid"));
    assert_eq!(info.dns_names, vec!["node-1", "node-1.example.com"]);
    assert_eq!(info.ips, ips);
    assert!(info.server_auth && !info.client_auth);
    assert!(info.digital_signature && info.key_encipherment);
    assert!(!info.is_ca);
    assert!((info.lifetime_secs() - LEAF_VALIDITY.as_secs() as i64).abs() <= 1);
}

#[test]
fn issuance_honours_supplied_wall_time() {
    let ca = ca();
    let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let issued = ca.issue(&LeafTemplate::client("admin").issued_at(at).valid_for(Duration::from_secs(3600))).unwrap();
    let info = CertificateInfo::from_pem(&issued.cert_pem).unwrap();
    assert_eq!(info.not_before, 1_700_000_000);
    assert_eq!(info.not_after, 1_700_003_600);
    assert!(info.client_auth && !info.server_auth);
}

#[test]
fn csr_signing_keeps_requested_identity() {
    let ca = ca();
    let req = CertificateRequest::new(
        &LeafTemplate::server("worker-1").with_dns_names(&["worker-1".to_string()]).with_ips(&["10.5.0.2".parse().unwrap()]),
    )
    .unwrap();
    let cert = ca.sign_csr(&req.csr_pem, &LeafTemplate::server("")).unwrap();
    let info = CertificateInfo::from_pem(&cert).unwrap();
    assert_eq!(info.common_name.as_deref(), Some("worker-1"));
    assert_eq!(info.dns_names, vec!["worker-1"]);
    assert_eq!(info.ips, vec!["10.5.0.2".parse::<IpAddr>().unwrap()]);
    assert!(info.server_auth);

    assert!(ca.sign_csr("-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n", &LeafTemplate::server("")).is_err());
}

#[test]
fn fingerprint_tracks_the_key_not_the_certificate() {
    let ca = ca();
    let a = ca.issue(&LeafTemplate::server("a")).unwrap();
    let b = ca.issue(&LeafTemplate::server("a")).unwrap();
    let fa = spki_fingerprint(&a.cert_pem).unwrap();
    assert_eq!(fa.len(), 64);
    assert_eq!(fa, spki_fingerprint(&a.cert_pem).unwrap());
    assert_ne!(fa, spki_fingerprint(&b.cert_pem).unwrap());
}

#[test]
fn bundle_joins_and_counts_certificates() {
    let (a, b) = (ca(), ca());
    let bundle = trust_bundle([a.cert_pem(), "", b.cert_pem()]);
    assert_eq!(count_certificates(&bundle), 2);
    assert!(bundle.contains("-----END CERTIFICATE-----\n\n-----BEGIN CERTIFICATE-----"));
    assert_eq!(trust_bundle(Vec::<&str>::new()), "");
}

#[cfg(unix)]
#[test]
fn pem_files_get_restrictive_key_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let issued = ca().issue(&LeafTemplate::server("x")).unwrap();
    let (crt, key) = write_pem_files(dir.path(), "apid", &issued).unwrap();
    assert_eq!(std::fs::read_to_string(&crt).unwrap(), issued.cert_pem);
    assert_eq!(std::fs::metadata(&key).unwrap().permissions().mode() & 0o777, 0o400);
    assert_eq!(std::fs::metadata(&crt).unwrap().permissions().mode() & 0o777, 0o644);

    // Rewriting over a read-only key succeeds.
    let next = ca().issue(&LeafTemplate::server("x")).unwrap();
    write_pem_files(dir.path(), "apid", &next).unwrap();
    assert_eq!(std::fs::read_to_string(&key).unwrap(), next.key_pem);
}
