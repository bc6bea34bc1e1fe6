use std::net::IpAddr;

use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::network::{HostnameStatusSpec, NodeAddressSpec, HOSTNAME_STATUS_ID, NODE_ADDRESS_CURRENT_ID};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

/// Hostname derived from the first node address, `bastion-10-2-1-3`.
pub(crate) fn default_hostname(addr: IpAddr) -> String {
    let s = addr.to_string().replace(['.', ':'], "-");
    format!("bastion-{}", s.trim_matches('-'))
}

/// Publishes `HostnameStatus` from config, falling back to an address-derived name.
#[derive(Debug, Default)]
pub struct HostnameController;

#[async_trait]
impl Controller for HostnameController {
    fn name(&self) -> &str { "network.HostnameController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID),
            Input::weak_id::<NodeAddressSpec>(NODE_ADDRESS_CURRENT_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<HostnameStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let net = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.machine.network)
                .unwrap_or_default();
            let first = safe::get_opt::<NodeAddressSpec, _>(&*r, NODE_ADDRESS_CURRENT_ID)?
                .and_then(|a| a.spec.ips().next());
            let hostname = match (net.hostname, first) {
                (Some(h), _) if !h.is_empty() => h,
                (_, Some(addr)) => default_hostname(addr),
                _ => continue,
            };
            let status = HostnameStatusSpec { hostname, domainname: net.domainname.unwrap_or_default() };
            status.validate().map_err(anyhow::Error::msg).context("invalid hostname")?;

            safe::modify::<HostnameStatusSpec, _, _, anyhow::Error>(&*r, HOSTNAME_STATUS_ID, |spec| {
                *spec = status.clone();
                Ok(())
            })
            .context("error modifying hostname status")?;
        }
    }
}
