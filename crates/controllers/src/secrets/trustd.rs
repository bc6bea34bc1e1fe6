use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bastion_pki::{CertificateAuthority, LeafTemplate};
use bastion_resources::config::{MachineTypeSpec, MACHINE_TYPE_ID};
use bastion_resources::secrets::{CertSanSpec, OsRootSpec, TrustdCertsSpec, CERT_SAN_API_ID, OS_ROOT_ID, TRUSTD_CERTS_ID};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

use super::{log_issued, pem_pair, readiness_inputs, ready_to_issue, REFRESH_INTERVAL};

/// Issues the trustd server certificate on control plane nodes.
pub struct TrustdCertsController {
    clock: Arc<dyn Clock>,
}

impl TrustdCertsController {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock } }
}

#[async_trait]
impl Controller for TrustdCertsController {
    fn name(&self) -> &str { "secrets.TrustdCertsController" }

    fn inputs(&self) -> Vec<Input> {
        let mut inputs = vec![
            Input::weak_id::<OsRootSpec>(OS_ROOT_ID),
            Input::weak_id::<CertSanSpec>(CERT_SAN_API_ID),
            Input::weak_id::<MachineTypeSpec>(MACHINE_TYPE_ID),
        ];
        inputs.extend(readiness_inputs());
        inputs
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<TrustdCertsSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut refresh = Ticker::new(Arc::clone(&self.clock), REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                _ = refresh.tick() => {}
            }

            let control_plane = safe::get_opt::<MachineTypeSpec, _>(&*r, MACHINE_TYPE_ID)?
                .map(|m| m.spec.machine_type.is_control_plane())
                .unwrap_or(false);
            let os = safe::get_opt::<OsRootSpec, _>(&*r, OS_ROOT_ID)?;
            let Some(os) = os.filter(|_| control_plane) else {
                safe::cleanup_outputs::<TrustdCertsSpec, _, _>(&*r, |_| false).context("error destroying resources")?;
                continue;
            };
            let Some(sans) = safe::get_opt::<CertSanSpec, _>(&*r, CERT_SAN_API_ID)? else { continue };
            if !ready_to_issue(&*r)? {
                continue;
            }

            let os = os.spec;
            let ca = CertificateAuthority::from_pem(&os.issuing_ca.crt, &os.issuing_ca.key).context("failed to parse CA certificate")?;
            let template = LeafTemplate::server(&sans.spec.fqdn)
                .with_dns_names(&sans.spec.dns_names)
                .with_ips(&sans.spec.ips)
                .issued_at(self.clock.wall());
            let server = pem_pair(ca.issue(&template).context("failed to generate trustd server cert")?);

            safe::modify::<TrustdCertsSpec, _, _, anyhow::Error>(&*r, TRUSTD_CERTS_ID, |spec| {
                spec.accepted_cas = os.accepted_cas.clone();
                spec.server = server.clone();
                Ok(())
            })
            .context("error modifying resource")?;
            log_issued(self.name(), &[("server", &server)]);
            r.reset_restart_backoff();
        }
    }
}
