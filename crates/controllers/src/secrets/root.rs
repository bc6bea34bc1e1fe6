use std::net::IpAddr;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bastion_pki::{CertificateAuthority, CA_VALIDITY};
use bastion_resources::config::{MachineConfigSpec, MachineTypeSpec, MACHINE_CONFIG_ID, MACHINE_TYPE_ID};
use bastion_resources::secrets::{
    EtcdRootSpec, KubernetesRootSpec, MaintenanceRootSpec, OsRootSpec, PemCertificateAndKey, ETCD_ROOT_ID,
    KUBERNETES_ROOT_ID, MAINTENANCE_ROOT_ID, OS_ROOT_ID,
};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Local API server endpoint handed to control plane components.
const LOCAL_ENDPOINT: &str = "https://localhost:6443";

/// Derives root secrets and the machine type from the machine config, and
/// generates the maintenance CA once per boot.
#[derive(Debug, Default)]
pub struct RootController;

#[async_trait]
impl Controller for RootController {
    fn name(&self) -> &str { "secrets.RootController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID)] }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<OsRootSpec>(),
            Output::exclusive::<KubernetesRootSpec>(),
            Output::exclusive::<EtcdRootSpec>(),
            Output::exclusive::<MaintenanceRootSpec>(),
            Output::exclusive::<MachineTypeSpec>(),
        ]
    }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            if safe::get_opt::<MaintenanceRootSpec, _>(&*r, MAINTENANCE_ROOT_ID)?.is_none() {
                let ca = CertificateAuthority::generate("", "bastion", CA_VALIDITY).context("error generating maintenance CA")?;
                let ca = PemCertificateAndKey::new(ca.cert_pem(), ca.key_pem().unwrap_or_default());
                safe::modify::<MaintenanceRootSpec, _, _, anyhow::Error>(&*r, MAINTENANCE_ROOT_ID, |spec| {
                    spec.ca = ca.clone();
                    Ok(())
                })?;
                info!("generated maintenance CA");
            }

            let Some(cfg) = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)? else {
                continue;
            };
            let cfg = cfg.spec;
            let machine_type = cfg.machine.machine_type;

            safe::modify::<MachineTypeSpec, _, _, anyhow::Error>(&*r, MACHINE_TYPE_ID, |spec| {
                spec.machine_type = machine_type;
                Ok(())
            })
            .context("error updating machine type")?;

            let os = os_root(&cfg);
            safe::modify::<OsRootSpec, _, _, anyhow::Error>(&*r, OS_ROOT_ID, |spec| {
                *spec = os.clone();
                Ok(())
            })
            .context("error updating OS root secrets")?;

            if machine_type.is_control_plane() {
                let k8s = kubernetes_root(&cfg)?;
                safe::modify::<KubernetesRootSpec, _, _, anyhow::Error>(&*r, KUBERNETES_ROOT_ID, |spec| {
                    *spec = k8s.clone();
                    Ok(())
                })
                .context("error updating kubernetes root secrets")?;

                if cfg.cluster.etcd_ca.is_empty() {
                    bail!("missing cluster.etcdCa secret");
                }
                let etcd_ca = cfg.cluster.etcd_ca.clone();
                safe::modify::<EtcdRootSpec, _, _, anyhow::Error>(&*r, ETCD_ROOT_ID, |spec| {
                    spec.etcd_ca = etcd_ca.clone();
                    Ok(())
                })
                .context("error updating etcd root secrets")?;
            } else {
                safe::cleanup_outputs::<KubernetesRootSpec, _, _>(&*r, |_| false)?;
                safe::cleanup_outputs::<EtcdRootSpec, _, _>(&*r, |_| false)?;
            }
            debug!(machine_type = %machine_type, "root secrets reconciled");
        }
    }
}

/// Accepted CAs always include the issuing CA; a cert-only issuing CA is
/// dropped since workers receive no key.
fn split_issuing(ca: &PemCertificateAndKey) -> (PemCertificateAndKey, Vec<String>) {
    let accepted = if ca.is_empty() { Vec::new() } else { vec![ca.crt.clone()] };
    let issuing = if ca.has_key() { ca.clone() } else { PemCertificateAndKey::default() };
    (issuing, accepted)
}

pub(crate) fn os_root(cfg: &MachineConfigSpec) -> OsRootSpec {
    let (issuing_ca, accepted_cas) = split_issuing(&cfg.machine.ca);
    let mut spec = OsRootSpec { issuing_ca, accepted_cas, token: cfg.machine.token.clone(), ..Default::default() };
    for san in &cfg.machine.cert_sans {
        match san.parse::<IpAddr>() {
            Ok(ip) => spec.cert_san_ips.push(ip),
            Err(_) => spec.cert_san_dns_names.push(san.clone()),
        }
    }
    spec
}

pub(crate) fn kubernetes_root(cfg: &MachineConfigSpec) -> anyhow::Result<KubernetesRootSpec> {
    let cluster = &cfg.cluster;
    let (issuing_ca, accepted_cas) = split_issuing(&cluster.ca);
    if accepted_cas.is_empty() {
        bail!("missing cluster.ca secret");
    }
    if cluster.aggregator_ca.is_empty() {
        bail!("missing cluster.aggregatorCa secret");
    }
    Ok(KubernetesRootSpec {
        name: cluster.name.clone(),
        endpoint: cluster.endpoint.clone(),
        local_endpoint: LOCAL_ENDPOINT.to_string(),
        cert_sans: cluster.api_server_cert_sans.clone(),
        api_server_ips: cluster.api_server_ips.clone(),
        dns_domain: cluster.dns_domain().to_string(),
        issuing_ca,
        accepted_cas,
        aggregator_ca: cluster.aggregator_ca.clone(),
    })
}
