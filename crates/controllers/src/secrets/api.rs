use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bastion_pki::{CertificateAuthority, CertificateRequest, LeafTemplate};
use bastion_resources::config::{MachineType, MachineTypeSpec, MACHINE_TYPE_ID};
use bastion_resources::k8s::{EndpointSpec, CONTROL_PLANE_ENDPOINTS_ID};
use bastion_resources::network::{NetworkStatusSpec, NETWORK_STATUS_ID};
use bastion_resources::secrets::{ApiCertsSpec, CertSanSpec, OsRootSpec, PemCertificateAndKey, API_CERTS_ID, CERT_SAN_API_ID, OS_ROOT_ID};
use bastion_runtime::{Clock, Controller, ControllerHandle, Input, Output, Ticker};
use bastion_store::safe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{log_issued, pem_pair, readiness_inputs, ready_to_issue, REFRESH_INTERVAL};

/// Organization of the API client certificate.
pub const IMPERSONATOR_ORG: &str = "os:impersonator";

/// CA certificate and the certificate signed from a CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub ca_pem: String,
    pub cert_pem: String,
}

/// Signs CSRs on behalf of workers, authenticated by the machine token.
#[async_trait]
pub trait RemoteIssuer: Send + Sync + 'static {
    async fn sign(&self, ctx: CancellationToken, endpoints: &[IpAddr], token: &str, csr_pem: &str) -> anyhow::Result<SignedCertificate>;
}

/// In-process issuer backed by a CA with its key.
pub struct LocalIssuer {
    ca: CertificateAuthority,
    token: String,
}

impl LocalIssuer {
    pub fn new(ca: CertificateAuthority, token: impl Into<String>) -> Self { Self { ca, token: token.into() } }
}

#[async_trait]
impl RemoteIssuer for LocalIssuer {
    async fn sign(&self, ctx: CancellationToken, _endpoints: &[IpAddr], token: &str, csr_pem: &str) -> anyhow::Result<SignedCertificate> {
        if ctx.is_cancelled() {
            bail!("signing cancelled");
        }
        if token != self.token {
            bail!("token mismatch");
        }
        let usages = LeafTemplate::peer("");
        let cert_pem = self.ca.sign_csr(csr_pem, &usages)?;
        Ok(SignedCertificate { ca_pem: self.ca.cert_pem().to_string(), cert_pem })
    }
}

/// Issuer for nodes without a signing transport; every request fails.
#[derive(Debug, Default)]
pub struct NoRemoteIssuer;

#[async_trait]
impl RemoteIssuer for NoRemoteIssuer {
    async fn sign(&self, _ctx: CancellationToken, endpoints: &[IpAddr], _token: &str, _csr_pem: &str) -> anyhow::Result<SignedCertificate> {
        Err(anyhow!("no remote issuer configured (endpoints {endpoints:?})"))
    }
}

/// Issues the OS API server and client certificates. Control plane nodes sign
/// with the local issuing CA; workers send CSRs to a remote issuer.
pub struct ApiCertsController {
    clock: Arc<dyn Clock>,
    issuer: Arc<dyn RemoteIssuer>,
}

impl ApiCertsController {
    pub fn new(clock: Arc<dyn Clock>, issuer: Arc<dyn RemoteIssuer>) -> Self { Self { clock, issuer } }
}

enum Issued {
    Done,
    Wait,
    Aborted,
}

#[async_trait]
impl Controller for ApiCertsController {
    fn name(&self) -> &str { "secrets.ApiCertsController" }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<NetworkStatusSpec>(NETWORK_STATUS_ID),
            Input::weak_id::<MachineTypeSpec>(MACHINE_TYPE_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<ApiCertsSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let Some(mt) = safe::get_opt::<MachineTypeSpec, _>(&*r, MACHINE_TYPE_ID).context("error getting machine type")? else {
                continue;
            };
            let Some(net) = safe::get_opt::<NetworkStatusSpec, _>(&*r, NETWORK_STATUS_ID)? else { continue };
            if !(net.spec.address_ready && net.spec.hostname_ready) {
                continue;
            }

            match mt.spec.machine_type {
                MachineType::Unknown => {}
                t => return self.reconcile(&ctx, r, t.is_control_plane()).await,
            }
            safe::cleanup_outputs::<ApiCertsSpec, _, _>(&*r, |_| false)?;
        }
    }
}

impl ApiCertsController {
    async fn reconcile(&self, ctx: &CancellationToken, r: &mut ControllerHandle, control_plane: bool) -> anyhow::Result<()> {
        let mut inputs = vec![
            Input::weak_id::<OsRootSpec>(OS_ROOT_ID),
            Input::weak_id::<CertSanSpec>(CERT_SAN_API_ID),
            Input::weak_id::<MachineTypeSpec>(MACHINE_TYPE_ID),
        ];
        inputs.extend(readiness_inputs());
        if !control_plane {
            inputs.push(Input::weak_id::<EndpointSpec>(CONTROL_PLANE_ENDPOINTS_ID));
        }
        r.update_inputs(inputs).await;
        info!(control_plane, "api certificates branch selected");

        let mut refresh = Ticker::new(Arc::clone(&self.clock), REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
                _ = refresh.tick() => {}
            }

            let mt = safe::get_opt::<MachineTypeSpec, _>(&*r, MACHINE_TYPE_ID).context("error getting machine type")?;
            let mt = mt.map(|m| m.spec.machine_type).unwrap_or_default();
            if mt == MachineType::Unknown || mt.is_control_plane() != control_plane {
                bail!("machine type changed");
            }

            let Some(os) = safe::get_opt::<OsRootSpec, _>(&*r, OS_ROOT_ID).context("error getting OS root secrets")? else {
                safe::cleanup_outputs::<ApiCertsSpec, _, _>(&*r, |_| false).context("error destroying resources")?;
                continue;
            };
            let Some(sans) = safe::get_opt::<CertSanSpec, _>(&*r, CERT_SAN_API_ID)? else { continue };
            if !ready_to_issue(&*r)? {
                continue;
            }

            if control_plane {
                self.issue_local(r, &os.spec, &sans.spec)?;
                continue;
            }
            match self.issue_remote(ctx, r, &os.spec, &sans.spec).await? {
                Issued::Done | Issued::Wait => {}
                Issued::Aborted if ctx.is_cancelled() => return Ok(()),
                Issued::Aborted => r.queue_reconcile(),
            }
        }
    }

    fn issue_local(&self, r: &ControllerHandle, os: &OsRootSpec, sans: &CertSanSpec) -> anyhow::Result<()> {
        if !os.issuing_ca.has_key() {
            bail!("control plane node has no issuing CA key");
        }
        let ca = CertificateAuthority::from_pem(&os.issuing_ca.crt, &os.issuing_ca.key).context("failed to parse CA certificate")?;
        let now = self.clock.wall();
        let server = ca
            .issue(&LeafTemplate::server(&sans.fqdn).with_dns_names(&sans.dns_names).with_ips(&sans.ips).issued_at(now))
            .context("failed to generate API server cert")?;
        let client = ca
            .issue(&LeafTemplate::client(&sans.fqdn).with_organization(IMPERSONATOR_ORG).issued_at(now))
            .context("failed to generate API client cert")?;
        self.store(r, os.accepted_cas.clone(), pem_pair(server), pem_pair(client))
    }

    /// Runs CSR signing as a task owned by this loop. An input change or
    /// cancellation aborts the task, which is awaited before returning.
    async fn issue_remote(&self, ctx: &CancellationToken, r: &mut ControllerHandle, os: &OsRootSpec, sans: &CertSanSpec) -> anyhow::Result<Issued> {
        let Some(endpoints) = safe::get_opt::<EndpointSpec, _>(&*r, CONTROL_PLANE_ENDPOINTS_ID).context("error getting endpoints resource")? else {
            return Ok(Issued::Wait);
        };
        if endpoints.spec.addresses.is_empty() {
            return Ok(Issued::Wait);
        }

        let server_req = CertificateRequest::new(&LeafTemplate::server(&sans.fqdn).with_dns_names(&sans.dns_names).with_ips(&sans.ips))
            .context("failed to generate API server CSR")?;
        let client_req = CertificateRequest::new(&LeafTemplate::client(&sans.fqdn).with_organization(IMPERSONATOR_ORG))
            .context("failed to generate API client CSR")?;

        let token = ctx.child_token();
        let mut task: JoinHandle<anyhow::Result<(SignedCertificate, SignedCertificate)>> = {
            let issuer = Arc::clone(&self.issuer);
            let token = token.clone();
            let addrs = endpoints.spec.addresses.clone();
            let secret = os.token.clone();
            let (server_csr, client_csr) = (server_req.csr_pem.clone(), client_req.csr_pem.clone());
            tokio::spawn(async move {
                let server = issuer.sign(token.clone(), &addrs, &secret, &server_csr).await.context("failed to sign API server CSR")?;
                let client = issuer.sign(token, &addrs, &secret, &client_csr).await.context("failed to sign API client CSR")?;
                Ok((server, client))
            })
        };
        let joined = tokio::select! {
            res = &mut task => res,
            _ = ctx.cancelled() => {
                abort_issuance(token, task).await;
                return Ok(Issued::Aborted);
            }
            _ = r.next_event() => {
                debug!("inputs changed during CSR issuance; aborting");
                abort_issuance(token, task).await;
                return Ok(Issued::Aborted);
            }
        };
        let (server, client) = joined.context("CSR issuance task panicked")??;

        let server = PemCertificateAndKey::new(server.cert_pem, server_req.key_pem);
        let client_ca = client.ca_pem.clone();
        let client = PemCertificateAndKey::new(client.cert_pem, client_req.key_pem);
        self.store(r, vec![client_ca], server, client)?;
        Ok(Issued::Done)
    }

    fn store(&self, r: &ControllerHandle, accepted_cas: Vec<String>, server: PemCertificateAndKey, client: PemCertificateAndKey) -> anyhow::Result<()> {
        safe::modify::<ApiCertsSpec, _, _, anyhow::Error>(r, API_CERTS_ID, |spec| {
            spec.accepted_cas = accepted_cas.clone();
            spec.server = server.clone();
            spec.client = client.clone();
            Ok(())
        })
        .context("error modifying resource")?;
        log_issued(self.name(), &[("server", &server), ("client", &client)]);
        r.reset_restart_backoff();
        Ok(())
    }
}

async fn abort_issuance<T>(token: CancellationToken, task: JoinHandle<T>) {
    token.cancel();
    if let Err(e) = task.await {
        warn!(error = %e, "CSR issuance task failed to join");
    }
}
