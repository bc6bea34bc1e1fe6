use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bastion_pki::{CertificateAuthority, LeafTemplate};
use bastion_resources::secrets::{
    CertSanSpec, KubernetesDynamicCertsSpec, KubernetesRootSpec, CERT_SAN_KUBERNETES_ID, KUBERNETES_DYNAMIC_CERTS_ID,
    KUBERNETES_ROOT_ID,
};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;

use super::{log_issued, pem_pair, readiness_inputs, ready_to_issue, REFRESH_INTERVAL};

pub const API_SERVER_CN: &str = "kube-apiserver";
pub const API_SERVER_ORG: &str = "kube-master";
pub const KUBELET_CLIENT_CN: &str = "apiserver-kubelet-client";
pub const KUBELET_CLIENT_ORG: &str = "system:masters";
pub const FRONT_PROXY_CN: &str = "front-proxy-client";

/// Issues the API server, kubelet client and front proxy certificates from
/// the Kubernetes root CAs.
pub struct KubernetesDynamicCertsController {
    clock: Arc<dyn Clock>,
}

impl KubernetesDynamicCertsController {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { clock } }

    fn issue(&self, root: &KubernetesRootSpec, sans: &CertSanSpec) -> anyhow::Result<KubernetesDynamicCertsSpec> {
        let now = self.clock.wall();
        let ca = CertificateAuthority::from_pem(&root.issuing_ca.crt, &root.issuing_ca.key).context("failed to parse CA certificate")?;
        let api_server = ca
            .issue(
                &LeafTemplate::server(API_SERVER_CN)
                    .with_organization(API_SERVER_ORG)
                    .with_dns_names(&sans.dns_names)
                    .with_ips(&sans.ips)
                    .issued_at(now),
            )
            .context("failed to generate api-server cert")?;
        let kubelet_client = ca
            .issue(&LeafTemplate::client(KUBELET_CLIENT_CN).with_organization(KUBELET_CLIENT_ORG).issued_at(now))
            .context("failed to generate api-server kubelet client cert")?;

        let aggregator = CertificateAuthority::from_pem(&root.aggregator_ca.crt, &root.aggregator_ca.key)
            .context("failed to parse aggregator CA")?;
        let front_proxy = aggregator
            .issue(&LeafTemplate::client(FRONT_PROXY_CN).issued_at(now))
            .context("failed to generate aggregator cert")?;

        Ok(KubernetesDynamicCertsSpec {
            api_server: pem_pair(api_server),
            api_server_kubelet_client: pem_pair(kubelet_client),
            front_proxy: pem_pair(front_proxy),
        })
    }
}

#[async_trait]
impl Controller for KubernetesDynamicCertsController {
    fn name(&self) -> &str { "secrets.KubernetesDynamicCertsController" }

    fn inputs(&self) -> Vec<Input> {
        let mut inputs = vec![
            Input::weak_id::<KubernetesRootSpec>(KUBERNETES_ROOT_ID),
            Input::weak_id::<CertSanSpec>(CERT_SAN_KUBERNETES_ID),
        ];
        inputs.extend(readiness_inputs());
        inputs
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<KubernetesDynamicCertsSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut refresh = Ticker::new(Arc::clone(&self.clock), REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                _ = refresh.tick() => {}
            }

            let Some(root) = safe::get_opt::<KubernetesRootSpec, _>(&*r, KUBERNETES_ROOT_ID)? else {
                safe::cleanup_outputs::<KubernetesDynamicCertsSpec, _, _>(&*r, |_| false).context("error destroying resources")?;
                continue;
            };
            let Some(sans) = safe::get_opt::<CertSanSpec, _>(&*r, CERT_SAN_KUBERNETES_ID)? else { continue };
            if !ready_to_issue(&*r)? {
                continue;
            }

            let certs = self.issue(&root.spec, &sans.spec)?;
            safe::modify::<KubernetesDynamicCertsSpec, _, _, anyhow::Error>(&*r, KUBERNETES_DYNAMIC_CERTS_ID, |spec| {
                *spec = certs.clone();
                Ok(())
            })
            .context("error modifying resource")?;
            log_issued(
                self.name(),
                &[
                    ("api-server", &certs.api_server),
                    ("kubelet-client", &certs.api_server_kubelet_client),
                    ("front-proxy", &certs.front_proxy),
                ],
            );
            r.reset_restart_backoff();
        }
    }
}
