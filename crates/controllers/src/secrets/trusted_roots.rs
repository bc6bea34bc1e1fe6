use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use bastion_pki::{count_certificates, trust_bundle};
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::secrets::{TrustedRootsSpec, TRUSTED_ROOTS_ID};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::fsutil::write_atomic;

/// Merges the default CA bundle with user-supplied roots and optionally
/// writes the result to a file (0644).
pub struct TrustedRootsController {
    default_bundle: String,
    out: Option<PathBuf>,
}

impl TrustedRootsController {
    pub fn new(default_bundle: impl Into<String>, out: Option<PathBuf>) -> Self {
        Self { default_bundle: default_bundle.into(), out }
    }
}

#[async_trait]
impl Controller for TrustedRootsController {
    fn name(&self) -> &str { "secrets.TrustedRootsController" }

    fn inputs(&self) -> Vec<Input> { vec![Input::weak_id::<MachineConfigSpec>(MACHINE_CONFIG_ID)] }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<TrustedRootsSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let user = safe::get_opt::<MachineConfigSpec, _>(&*r, MACHINE_CONFIG_ID)?
                .map(|c| c.spec.machine.trusted_roots)
                .unwrap_or_default();
            let bundle = trust_bundle(std::iter::once(self.default_bundle.as_str()).chain(user.iter().map(String::as_str)));
            let certificates = count_certificates(&bundle);

            let res = safe::modify::<TrustedRootsSpec, _, _, anyhow::Error>(&*r, TRUSTED_ROOTS_ID, |spec| {
                spec.bundle = bundle.clone();
                spec.certificates = certificates;
                Ok(())
            })
            .context("error updating trusted roots")?;

            if let Some(path) = &self.out {
                write_atomic(path, bundle.as_bytes(), 0o644).with_context(|| format!("error writing {}", path.display()))?;
            }
            info!(certificates, version = res.metadata.version, "trusted roots updated");
        }
    }
}
