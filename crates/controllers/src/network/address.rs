use anyhow::Context;
use async_trait::async_trait;
use bastion_core::ListOptions;
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::network::{
    HostnameStatusSpec, LinkStatusSpec, NetworkStatusSpec, NodeAddressSpec, HOSTNAME_STATUS_ID, NETWORK_STATUS_ID,
    NODE_ADDRESS_CURRENT_ID,
};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Publishes the configured node addresses as `NodeAddress` "current".
#[derive(Debug, Default)]
pub struct NodeAddressController;

#[async_trait]
impl Controller for NodeAddressController {
    fn name(&self) -> &str { "network.NodeAddressController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID)] }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<NodeAddressSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let mut addresses = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.machine.network.addresses)
                .unwrap_or_default();
            if addresses.is_empty() {
                safe::cleanup_outputs::<NodeAddressSpec, _, _>(&*r, |_| false)?;
                continue;
            }
            addresses.sort();
            addresses.dedup();
            safe::modify::<NodeAddressSpec, _, _, anyhow::Error>(&*r, NODE_ADDRESS_CURRENT_ID, |spec| {
                spec.addresses = addresses.clone();
                Ok(())
            })
            .context("error modifying node addresses")?;
        }
    }
}

/// Aggregates readiness: addresses assigned, hostname set, any link up.
#[derive(Debug, Default)]
pub struct NetworkStatusController;

#[async_trait]
impl Controller for NetworkStatusController {
    fn name(&self) -> &str { "network.StatusController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<NodeAddressSpec>(NODE_ADDRESS_CURRENT_ID),
            Input::weak_id::<HostnameStatusSpec>(HOSTNAME_STATUS_ID),
            Input::weak::<LinkStatusSpec>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<NetworkStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let address_ready = safe::get_opt::<NodeAddressSpec, _>(&*r, NODE_ADDRESS_CURRENT_ID)?
                .map(|a| !a.spec.addresses.is_empty())
                .unwrap_or(false);
            let hostname_ready = safe::get_opt::<HostnameStatusSpec, _>(&*r, HOSTNAME_STATUS_ID)?.is_some();
            let connectivity_ready =
                safe::list::<LinkStatusSpec, _>(&*r, &ListOptions::default())?.iter().any(|l| l.spec.is_up());

            let status = NetworkStatusSpec { address_ready, connectivity_ready, hostname_ready };
            let prev = safe::get_opt::<NetworkStatusSpec, _>(&*r, NETWORK_STATUS_ID)?.map(|s| s.spec);
            if prev.as_ref() != Some(&status) {
                info!(address_ready, hostname_ready, connectivity_ready, "network status changed");
            }
            safe::modify::<NetworkStatusSpec, _, _, anyhow::Error>(&*r, NETWORK_STATUS_ID, |spec| {
                *spec = status.clone();
                Ok(())
            })
            .context("error modifying network status")?;
        }
    }
}
