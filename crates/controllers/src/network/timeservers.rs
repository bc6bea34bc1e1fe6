use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::network::{TimeServerStatusSpec, TIME_SERVER_STATUS_ID};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIME_SERVER: &str = "time.cloudflare.com";

/// Publishes the NTP server list, defaulting to [`DEFAULT_TIME_SERVER`].
#[derive(Debug, Default)]
pub struct TimeServerController;

#[async_trait]
impl Controller for TimeServerController {
    fn name(&self) -> &str { "network.TimeServerController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID)] }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<TimeServerStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let mut servers = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.machine.time.servers)
                .unwrap_or_default();
            if servers.is_empty() {
                servers.push(DEFAULT_TIME_SERVER.to_string());
            }
            safe::modify::<TimeServerStatusSpec, _, _, anyhow::Error>(&*r, TIME_SERVER_STATUS_ID, |spec| {
                spec.ntp_servers = servers.clone();
                Ok(())
            })
            .context("error modifying time servers")?;
        }
    }
}
