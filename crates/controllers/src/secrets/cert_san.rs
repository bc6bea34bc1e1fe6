use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use bastion_resources::network::{HostnameStatusSpec, NodeAddressSpec, HOSTNAME_STATUS_ID, NODE_ADDRESS_CURRENT_ID};
use bastion_resources::secrets::{
    CertSanSpec, KubernetesRootSpec, OsRootSpec, CERT_SAN_API_ID, CERT_SAN_KUBERNETES_ID, CERT_SAN_MAINTENANCE_ID,
    KUBERNETES_ROOT_ID, OS_ROOT_ID,
};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

/// Common name used by the maintenance service before a hostname is known.
const MAINTENANCE_FQDN: &str = "maintenance-service";

/// Derives the SAN sets of the OS API (`api`) and the Kubernetes API server (`k8s`).
#[derive(Debug, Default)]
pub struct CertSanController;

#[async_trait]
impl Controller for CertSanController {
    fn name(&self) -> &str { "secrets.CertSanController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<OsRootSpec>(OS_ROOT_ID),
            Input::weak_id::<KubernetesRootSpec>(KUBERNETES_ROOT_ID),
            Input::weak_id::<HostnameStatusSpec>(HOSTNAME_STATUS_ID),
            Input::weak_id::<NodeAddressSpec>(NODE_ADDRESS_CURRENT_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::shared::<CertSanSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let Some(hostname) = safe::get_opt::<HostnameStatusSpec, _>(&*r, HOSTNAME_STATUS_ID)? else { continue };
            let Some(addrs) = safe::get_opt::<NodeAddressSpec, _>(&*r, NODE_ADDRESS_CURRENT_ID)? else { continue };

            let mut touched = Vec::new();
            if let Some(os) = safe::get_opt::<OsRootSpec, _>(&*r, OS_ROOT_ID)? {
                let sans = api_sans(&os.spec, &hostname.spec, &addrs.spec);
                safe::modify::<CertSanSpec, _, _, anyhow::Error>(&*r, CERT_SAN_API_ID, |spec| {
                    *spec = sans.clone();
                    Ok(())
                })?;
                touched.push(CERT_SAN_API_ID);
            }
            if let Some(k8s) = safe::get_opt::<KubernetesRootSpec, _>(&*r, KUBERNETES_ROOT_ID)? {
                let sans = kubernetes_sans(&k8s.spec, &hostname.spec, &addrs.spec);
                safe::modify::<CertSanSpec, _, _, anyhow::Error>(&*r, CERT_SAN_KUBERNETES_ID, |spec| {
                    *spec = sans.clone();
                    Ok(())
                })?;
                touched.push(CERT_SAN_KUBERNETES_ID);
            }
            safe::cleanup_outputs::<CertSanSpec, _, _>(&*r, |id| touched.contains(&id))?;
        }
    }
}

/// SANs of the maintenance service: hostname when known plus node addresses.
#[derive(Debug, Default)]
pub struct MaintenanceCertSanController;

#[async_trait]
impl Controller for MaintenanceCertSanController {
    fn name(&self) -> &str { "secrets.MaintenanceCertSanController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<HostnameStatusSpec>(HOSTNAME_STATUS_ID),
            Input::weak_id::<NodeAddressSpec>(NODE_ADDRESS_CURRENT_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::shared::<CertSanSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let Some(addrs) = safe::get_opt::<NodeAddressSpec, _>(&*r, NODE_ADDRESS_CURRENT_ID)? else { continue };
            let hostname = safe::get_opt::<HostnameStatusSpec, _>(&*r, HOSTNAME_STATUS_ID)?;

            let mut sans = CertSanSpec::default();
            match hostname {
                Some(h) => {
                    sans.append_dns_names([h.spec.hostname.clone(), h.spec.fqdn()]);
                    sans.fqdn = h.spec.fqdn();
                }
                None => sans.fqdn = MAINTENANCE_FQDN.to_string(),
            }
            sans.append_ips(addrs.spec.ips());
            sans.sort();
            safe::modify::<CertSanSpec, _, _, anyhow::Error>(&*r, CERT_SAN_MAINTENANCE_ID, |spec| {
                *spec = sans.clone();
                Ok(())
            })?;
        }
    }
}

pub(crate) fn api_sans(os: &OsRootSpec, hostname: &HostnameStatusSpec, addrs: &NodeAddressSpec) -> CertSanSpec {
    let mut sans = CertSanSpec::default();
    sans.append_dns_names(&os.cert_san_dns_names);
    sans.append_dns_names([hostname.hostname.clone(), hostname.fqdn()]);
    sans.append_ips(os.cert_san_ips.iter().copied());
    sans.append_ips(addrs.ips());
    sans.fqdn = hostname.fqdn();
    sans.sort();
    sans
}

pub(crate) fn kubernetes_sans(k8s: &KubernetesRootSpec, hostname: &HostnameStatusSpec, addrs: &NodeAddressSpec) -> CertSanSpec {
    let mut sans = CertSanSpec::default();
    let extra = endpoint_host(&k8s.endpoint).into_iter().chain(k8s.cert_sans.iter().cloned());
    for name in extra {
        match name.parse::<IpAddr>() {
            Ok(ip) => sans.append_ips([ip]),
            Err(_) => sans.append_dns_names([name]),
        }
    }
    sans.append_ips(k8s.api_server_ips.iter().copied());
    sans.append_dns_names([hostname.hostname.clone(), hostname.fqdn()]);
    sans.append_ips(addrs.ips());
    sans.append_dns_names([
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", k8s.dns_domain),
        "localhost".to_string(),
    ]);
    sans.append_ips([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    sans.fqdn = hostname.fqdn();
    sans.sort();
    sans
}

/// Host part of an endpoint URL such as `https://host:6443/path` or `https://[::1]:6443`.
pub(crate) fn endpoint_host(endpoint: &str) -> Option<String> {
    let rest = endpoint.split_once("://").map(|(_, r)| r).unwrap_or(endpoint);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split_once(']').map(|(h, _)| h).unwrap_or(v6)
    } else {
        authority.split_once(':').map(|(h, _)| h).unwrap_or(authority)
    };
    (!host.is_empty()).then(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_host_forms() {
        assert_eq!(endpoint_host("https://some.url:6443").as_deref(), Some("some.url"));
        assert_eq!(endpoint_host("https://[fd00::1]:6443/").as_deref(), Some("fd00::1"));
        assert_eq!(endpoint_host("10.0.0.1").as_deref(), Some("10.0.0.1"));
        assert_eq!(endpoint_host("https://"), None);
    }
}
