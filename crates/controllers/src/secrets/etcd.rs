use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bastion_pki::{CertificateAuthority, LeafTemplate};
use bastion_resources::config::{MachineTypeSpec, MACHINE_TYPE_ID};
use bastion_resources::etcd::{EtcdSpec, ETCD_SPEC_ID};
use bastion_resources::network::{HostnameStatusSpec, NodeAddressSpec, HOSTNAME_STATUS_ID, NODE_ADDRESS_CURRENT_ID};
use bastion_resources::secrets::{CertSanSpec, EtcdCertsSpec, EtcdRootSpec, ETCD_CERTS_ID, ETCD_ROOT_ID};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

use super::{log_issued, pem_pair, readiness_inputs, ready_to_issue, REFRESH_INTERVAL};

/// Publishes the etcd member spec on control plane nodes.
#[derive(Debug, Default)]
pub struct EtcdSpecController;

#[async_trait]
impl Controller for EtcdSpecController {
    fn name(&self) -> &str { "etcd.SpecController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<MachineTypeSpec>(MACHINE_TYPE_ID),
            Input::weak_id::<HostnameStatusSpec>(HOSTNAME_STATUS_ID),
            Input::weak_id::<NodeAddressSpec>(NODE_ADDRESS_CURRENT_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<EtcdSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let control_plane = safe::get_opt::<MachineTypeSpec, _>(&*r, MACHINE_TYPE_ID)?
                .map(|m| m.spec.machine_type.is_control_plane())
                .unwrap_or(false);
            if !control_plane {
                safe::cleanup_outputs::<EtcdSpec, _, _>(&*r, |_| false)?;
                continue;
            }
            let Some(hostname) = safe::get_opt::<HostnameStatusSpec, _>(&*r, HOSTNAME_STATUS_ID)? else { continue };
            let Some(addrs) = safe::get_opt::<NodeAddressSpec, _>(&*r, NODE_ADDRESS_CURRENT_ID)? else { continue };

            let advertised: Vec<IpAddr> = addrs.spec.ips().collect();
            let mut listen_client = advertised.clone();
            listen_client.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
            safe::modify::<EtcdSpec, _, _, anyhow::Error>(&*r, ETCD_SPEC_ID, |spec| {
                spec.name = hostname.spec.hostname.clone();
                spec.advertised_addresses = advertised.clone();
                spec.listen_peer_addresses = advertised.clone();
                spec.listen_client_addresses = listen_client.clone();
                Ok(())
            })
            .context("error updating etcd spec")?;
        }
    }
}

/// Issues etcd server and peer certificates from the etcd CA.
pub struct EtcdCertsController {
    clock: Arc<dyn Clock>,
}

impl EtcdCertsController {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock } }
}

pub(crate) fn etcd_sans(spec: &EtcdSpec, hostname: &HostnameStatusSpec) -> CertSanSpec {
    let mut sans = CertSanSpec::default();
    sans.append_dns_names([hostname.hostname.clone(), hostname.fqdn(), "localhost".to_string()]);
    sans.append_ips(spec.advertised_addresses.iter().copied());
    sans.append_ips(spec.listen_client_addresses.iter().copied());
    sans.append_ips([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    sans.fqdn = hostname.fqdn();
    sans.sort();
    sans
}

#[async_trait]
impl Controller for EtcdCertsController {
    fn name(&self) -> &str { "secrets.EtcdCertsController" }

    fn inputs(&self) -> Vec<Input> {
        let mut inputs = vec![
            Input::weak_id::<EtcdRootSpec>(ETCD_ROOT_ID),
            Input::weak_id::<EtcdSpec>(ETCD_SPEC_ID),
            Input::weak_id::<HostnameStatusSpec>(HOSTNAME_STATUS_ID),
        ];
        inputs.extend(readiness_inputs());
        inputs
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<EtcdCertsSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut refresh = Ticker::new(Arc::clone(&self.clock), REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                _ = refresh.tick() => {}
            }

            let Some(root) = safe::get_opt::<EtcdRootSpec, _>(&*r, ETCD_ROOT_ID)? else {
                safe::cleanup_outputs::<EtcdCertsSpec, _, _>(&*r, |_| false).context("error destroying resources")?;
                continue;
            };
            let Some(member) = safe::get_opt::<EtcdSpec, _>(&*r, ETCD_SPEC_ID)? else { continue };
            let Some(hostname) = safe::get_opt::<HostnameStatusSpec, _>(&*r, HOSTNAME_STATUS_ID)? else { continue };
            if !ready_to_issue(&*r)? {
                continue;
            }

            let sans = etcd_sans(&member.spec, &hostname.spec);
            let ca = CertificateAuthority::from_pem(&root.spec.etcd_ca.crt, &root.spec.etcd_ca.key)
                .context("failed to parse etcd CA")?;
            let now = self.clock.wall();
            let server = ca
                .issue(&LeafTemplate::server(&sans.fqdn).with_dns_names(&sans.dns_names).with_ips(&sans.ips).issued_at(now))
                .context("failed to generate etcd server cert")?;
            let peer = ca
                .issue(&LeafTemplate::peer(&sans.fqdn).with_dns_names(&sans.dns_names).with_ips(&sans.ips).issued_at(now))
                .context("failed to generate etcd peer cert")?;
            let (server, peer) = (pem_pair(server), pem_pair(peer));

            safe::modify::<EtcdCertsSpec, _, _, anyhow::Error>(&*r, ETCD_CERTS_ID, |spec| {
                spec.server = server.clone();
                spec.peer = peer.clone();
                Ok(())
            })
            .context("error modifying resource")?;
            log_issued(self.name(), &[("server", &server), ("peer", &peer)]);
            r.reset_restart_backoff();
        }
    }
}
