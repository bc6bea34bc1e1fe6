//! Control plane endpoint discovery.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::k8s::{EndpointSpec, CONTROL_PLANE_ENDPOINTS_ID};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::secrets::endpoint_host;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const RESOLVE_INTERVAL: Duration = Duration::from_secs(60);

/// Resolves `host` to its addresses, sorted and deduplicated.
pub(crate) async fn resolve(host: &str) -> anyhow::Result<Vec<IpAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let lookup = tokio::net::lookup_host((host, 0));
    let addrs = tokio::time::timeout(RESOLVE_TIMEOUT, lookup)
        .await
        .with_context(|| format!("timed out resolving {host}"))?
        .with_context(|| format!("error resolving {host}"))?;
    let mut out: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
    out.sort();
    out.dedup();
    Ok(out)
}

/// Publishes the addresses of the cluster endpoint host as `Endpoint` "control-plane".
pub struct ControlPlaneEndpointController {
    clock: Arc<dyn Clock>,
}

impl ControlPlaneEndpointController {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock } }
}

#[async_trait]
impl Controller for ControlPlaneEndpointController {
    fn name(&self) -> &str { "k8s.ControlPlaneEndpointController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID)] }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<EndpointSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut refresh = Ticker::new(Arc::clone(&self.clock), RESOLVE_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                _ = refresh.tick() => {}
            }

            let endpoint = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.cluster.endpoint)
                .unwrap_or_default();
            let Some(host) = endpoint_host(&endpoint) else {
                safe::cleanup_outputs::<EndpointSpec, _, _>(&*r, |_| false)?;
                continue;
            };
            let addresses = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                res = resolve(&host) => match res {
                    Ok(a) if !a.is_empty() => a,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(host = %host, error = %format!("{e:#}"), "control plane endpoint unresolved");
                        continue;
                    }
                },
            };
            debug!(host = %host, addresses = ?addresses, "control plane endpoint resolved");
            safe::modify::<EndpointSpec, _, _, anyhow::Error>(&*r, CONTROL_PLANE_ENDPOINTS_ID, |spec| {
                spec.addresses = addresses.clone();
                Ok(())
            })
            .context("error modifying endpoints")?;
        }
    }
}
