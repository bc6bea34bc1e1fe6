use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::runtime::{DevicesStatusSpec, DEVICES_STATUS_ID};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Declares devices ready once at startup. Device discovery happens before
/// the daemon starts.
#[derive(Debug, Default)]
pub struct DevicesStatusController;

#[async_trait]
impl Controller for DevicesStatusController {
    fn name(&self) -> &str { "runtime.DevicesStatusController" }

    fn inputs(&self) -> Vec<Input> { Vec::new() }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<DevicesStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }
            safe::modify::<DevicesStatusSpec, _, _, anyhow::Error>(&*r, DEVICES_STATUS_ID, |spec| {
                spec.ready = true;
                Ok(())
            })
            .context("error updating devices status")?;
            info!("devices ready");
        }
    }
}
