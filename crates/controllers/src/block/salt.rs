use anyhow::Context;
use async_trait::async_trait;
use bastion_resources::block::{VolumeMountRequestSpec, STATE_VOLUME_ID};
use bastion_resources::secrets::{EncryptionSaltSpec, ENCRYPTION_SALT_ID};
use bastion_runtime::{Controller, ControllerHandle, Input, Output};
use bastion_store::safe;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ScopedDir, VolumeMounter};

pub const SALT_FILE: &str = "encryption-salt.yaml";
pub const SALT_SIZE: usize = 32;

const CONTROLLER_NAME: &str = "block.EncryptionSaltController";

/// On-disk form; bytes are stored as a sequence of integers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SaltFile {
    disk_salt: Vec<u8>,
}

/// Reads the salt from `dir`, generating and persisting a new one when absent.
pub(crate) fn load_or_generate(dir: &ScopedDir) -> anyhow::Result<(Vec<u8>, bool)> {
    if let Some(raw) = dir.read(SALT_FILE).with_context(|| format!("error reading {SALT_FILE}"))? {
        let file: SaltFile = serde_yaml::from_slice(&raw).with_context(|| format!("error parsing {SALT_FILE}"))?;
        return Ok((file.disk_salt, false));
    }
    let mut salt = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let raw = serde_yaml::to_string(&SaltFile { disk_salt: salt.clone() })?;
    dir.write_atomic(SALT_FILE, raw.as_bytes(), 0o600).with_context(|| format!("error writing {SALT_FILE}"))?;
    Ok((salt, true))
}

/// Loads or generates the disk encryption salt stored on the STATE volume.
#[derive(Debug, Default)]
pub struct EncryptionSaltController;

#[async_trait]
impl Controller for EncryptionSaltController {
    fn name(&self) -> &str { CONTROLLER_NAME }

    fn inputs(&self) -> Vec<Input> { vec![VolumeMounter::status_input(CONTROLLER_NAME, STATE_VOLUME_ID)] }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<VolumeMountRequestSpec>(), Output::exclusive::<EncryptionSaltSpec>()]
    }

    async fn run(&mut self, ctx: CancellationToken, r: &mut ControllerHandle) -> anyhow::Result<()> {
        let mut mounter: Option<VolumeMounter> = None;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    if let Some(m) = mounter.as_mut() {
                        m.release(&*r)?;
                    }
                    return Ok(());
                }
                _ = r.next_event() => {}
            }

            if mounter.is_none() {
                if safe::get_opt::<EncryptionSaltSpec, _>(&*r, ENCRYPTION_SALT_ID)?.is_some() {
                    continue;
                }
                mounter = Some(VolumeMounter::new(CONTROLLER_NAME, STATE_VOLUME_ID));
            }
            let Some(m) = mounter.as_mut() else { continue };

            let done = m.step(&*r, |r, dir, _status| {
                let (salt, generated) = load_or_generate(dir)?;
                safe::modify::<EncryptionSaltSpec, _, _, anyhow::Error>(r, ENCRYPTION_SALT_ID, |spec| {
                    spec.disk_salt = salt.clone();
                    Ok(())
                })
                .context("error updating encryption salt")?;
                info!(generated, "encryption salt loaded");
                Ok(())
            })?;
            if done {
                mounter = None;
                r.reset_restart_backoff();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_salt_round_trips_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ScopedDir::open(tmp.path(), false).unwrap();
        let (salt, generated) = load_or_generate(&dir).unwrap();
        assert!(generated);
        assert_eq!(salt.len(), SALT_SIZE);

        let raw = std::fs::read_to_string(tmp.path().join(SALT_FILE)).unwrap();
        assert!(raw.starts_with("diskSalt:\n- "), "{raw}");

        let (again, generated) = load_or_generate(&dir).unwrap();
        assert!(!generated);
        assert_eq!(again, salt);
    }
}
