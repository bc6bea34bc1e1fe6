use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bastion_pki::{CertificateAuthority, KeyUsage, LeafTemplate};
use bastion_resources::secrets::{
    CertSanSpec, MaintenanceRootSpec, MaintenanceServiceCertsSpec, PemCertificateAndKey, CERT_SAN_MAINTENANCE_ID,
    MAINTENANCE_CERTS_ID, MAINTENANCE_ROOT_ID,
};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

use super::{log_issued, pem_pair, REFRESH_INTERVAL};

/// Issues the maintenance service certificate from the per-boot maintenance CA.
///
/// The maintenance service runs before networking and time are settled, so
/// issuance only waits for the CA and the SAN set.
pub struct MaintenanceCertsController {
    clock: Arc<dyn Clock>,
}

impl MaintenanceCertsController {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock } }
}

#[async_trait]
impl Controller for MaintenanceCertsController {
    fn name(&self) -> &str { "secrets.MaintenanceCertsController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<MaintenanceRootSpec>(MAINTENANCE_ROOT_ID),
            Input::weak_id::<CertSanSpec>(CERT_SAN_MAINTENANCE_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<MaintenanceServiceCertsSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut refresh = Ticker::new(Arc::clone(&self.clock), REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                _ = refresh.tick() => {}
            }

            let Some(root) = safe::get_opt::<MaintenanceRootSpec, _>(&*r, MAINTENANCE_ROOT_ID)? else { continue };
            let Some(sans) = safe::get_opt::<CertSanSpec, _>(&*r, CERT_SAN_MAINTENANCE_ID)? else { continue };

            let root = root.spec.ca;
            let ca = CertificateAuthority::from_pem(&root.crt, &root.key).context("failed to parse CA certificate")?;
            let template = LeafTemplate::server(&sans.spec.fqdn)
                .with_key_usages(vec![KeyUsage::DigitalSignature])
                .with_dns_names(&sans.spec.dns_names)
                .with_ips(&sans.spec.ips)
                .issued_at(self.clock.wall());
            let server = pem_pair(ca.issue(&template).context("failed to generate maintenance server cert")?);

            safe::modify::<MaintenanceServiceCertsSpec, _, _, anyhow::Error>(&*r, MAINTENANCE_CERTS_ID, |spec| {
                spec.ca = PemCertificateAndKey::cert_only(root.crt.clone());
                spec.server = server.clone();
                Ok(())
            })
            .context("error modifying resource")?;
            log_issued(self.name(), &[("server", &server)]);
            r.reset_restart_backoff();
        }
    }
}
