use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bastion_core::ListOptions;
use bastion_resources::block::{VolumeMountRequestSpec, VolumeMountStatusSpec};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::{safe, Writer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Makes volumes available as directories.
pub trait Mounter: Send + Sync + 'static {
    /// Mounts `volume_id` and returns its target path.
    fn mount(&self, volume_id: &str) -> anyhow::Result<PathBuf>;
    fn unmount(&self, volume_id: &str) -> anyhow::Result<()>;
}

/// Serves every volume as a subdirectory of `root`.
#[derive(Debug, Clone)]
pub struct DirMounter {
    root: PathBuf,
}

impl DirMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

impl Mounter for DirMounter {
    fn mount(&self, volume_id: &str) -> anyhow::Result<PathBuf> {
        let target = self.root.join(volume_id.to_ascii_lowercase());
        fs::create_dir_all(&target).with_context(|| format!("error creating {}", target.display()))?;
        Ok(target)
    }

    fn unmount(&self, _volume_id: &str) -> anyhow::Result<()> { Ok(()) }
}

/// Serves `VolumeMountRequest`s with one `VolumeMountStatus` each, and
/// unmounts once the request is gone and the status has no finalizers left.
pub struct VolumeMountController {
    mounter: Arc<dyn Mounter>,
}

impl VolumeMountController {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self { Self { mounter } }
}

#[async_trait]
impl Controller for VolumeMountController {
    fn name(&self) -> &str { "block.VolumeMountController" }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<VolumeMountRequestSpec>(), Input::destroy_ready::<VolumeMountStatusSpec>()]
    }

    fn outputs(&self) -> Vec<Output> { vec![Output::exclusive::<VolumeMountStatusSpec>()] }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.next_event() => {}
            }

            let requests: BTreeMap<String, VolumeMountRequestSpec> =
                safe::list::<VolumeMountRequestSpec, _>(&*r, &ListOptions::default())?
                    .into_iter()
                    .filter(|q| !q.metadata.is_tearing_down())
                    .map(|q| (q.metadata.id, q.spec))
                    .collect();

            for status in safe::list::<VolumeMountStatusSpec, _>(&*r, &ListOptions::default())? {
                let id = status.metadata.id.clone();
                if requests.contains_key(&id) && !status.metadata.is_tearing_down() {
                    continue;
                }
                if !r.teardown(&status.pointer()).context("error tearing down mount status")? {
                    debug!(mount = %id, "mount status held by finalizers");
                    continue;
                }
                r.destroy(&status.pointer()).context("error destroying mount status")?;
                self.mounter.unmount(&status.spec.volume_id)?;
                info!(mount = %id, volume = %status.spec.volume_id, "volume unmounted");
            }

            for (id, req) in &requests {
                if safe::get_opt::<VolumeMountStatusSpec, _>(&*r, id)?.is_some() {
                    continue;
                }
                let target = self.mounter.mount(&req.volume_id)?;
                safe::modify::<VolumeMountStatusSpec, _, _, anyhow::Error>(&*r, id, |st| {
                    st.volume_id = req.volume_id.clone();
                    st.requester = req.requester.clone();
                    st.target = target.display().to_string();
                    Ok(())
                })
                .context("error creating mount status")?;
                info!(mount = %id, volume = %req.volume_id, target = %target.display(), "volume mounted");
            }
        }
    }
}
