//! Volume mount automaton used by controllers that need a persistent volume
//! for the duration of one unit of work.
//!
//! ```text
//! Idle -> Requested -> Mounted -> Worked -> Released -> Idle
//! ```
//!
//! The requester name doubles as the finalizer held on the mount status while
//! the work runs.

use anyhow::Context;
use bastion_resources::block::{mount_id, VolumeMountRequestSpec, VolumeMountStatusSpec};
use bastion_resources::TypedSpec;
use bastion_runtime::{ControllerHandle, Input};
use bastion_store::{safe, Writer};
use tracing::debug;

use super::ScopedDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Idle,
    Requested,
    Mounted,
    Worked,
    Released,
}

/// One mount cycle per (requester, volume).
#[derive(Debug)]
pub struct VolumeMounter {
    requester: String,
    volume_id: String,
    mount_id: String,
    state: MountState,
    status: Option<VolumeMountStatusSpec>,
}

impl VolumeMounter {
    pub fn new(requester: impl Into<String>, volume_id: impl Into<String>) -> Self {
        let (requester, volume_id) = (requester.into(), volume_id.into());
        let mount_id = mount_id(&requester, &volume_id);
        Self { requester, volume_id, mount_id, state: MountState::Idle, status: None }
    }

    pub fn state(&self) -> MountState { self.state }
    pub fn mount_id(&self) -> &str { &self.mount_id }

    /// Strong input the owning controller must declare to hold the finalizer.
    pub fn status_input(requester: &str, volume_id: &str) -> Input {
        Input::strong::<VolumeMountStatusSpec>().with_id(mount_id(requester, volume_id))
    }

    /// Advances as far as the store allows. Returns true once a full cycle
    /// completed and the automaton is back to `Idle`.
    ///
    /// `work` runs exactly once per cycle with the mounted directory. When it
    /// fails the mount is released and the error returned.
    pub fn step<F>(&mut self, r: &ControllerHandle, work: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&ControllerHandle, &ScopedDir, &VolumeMountStatusSpec) -> anyhow::Result<()>,
    {
        let mut work = Some(work);
        loop {
            match self.state {
                MountState::Idle => {
                    safe::modify::<VolumeMountRequestSpec, _, _, anyhow::Error>(r, &self.mount_id, |req| {
                        req.volume_id = self.volume_id.clone();
                        req.requester = self.requester.clone();
                        Ok(())
                    })
                    .context("error creating volume mount request")?;
                    debug!(mount = %self.mount_id, "volume mount requested");
                    self.state = MountState::Requested;
                }
                MountState::Requested => {
                    let Some(status) = safe::get_opt::<VolumeMountStatusSpec, _>(r, &self.mount_id)
                        .context("error reading volume mount status")?
                    else {
                        return Ok(false);
                    };
                    if status.metadata.is_tearing_down() || status.spec.target.is_empty() {
                        return Ok(false);
                    }
                    if !status.metadata.finalizers.has(&self.requester) {
                        r.add_finalizer(&status.pointer(), &self.requester).context("error adding finalizer")?;
                    }
                    self.status = Some(status.spec);
                    self.state = MountState::Mounted;
                }
                MountState::Mounted => {
                    let status = self.status.clone().unwrap_or_default();
                    let res = match work.take() {
                        Some(f) => ScopedDir::open(&status.target, status.read_only)
                            .with_context(|| format!("error opening mount target {}", status.target))
                            .and_then(|dir| f(r, &dir, &status)),
                        None => Ok(()),
                    };
                    self.state = MountState::Worked;
                    if let Err(e) = res {
                        self.release(r)?;
                        return Err(e);
                    }
                }
                MountState::Worked => {
                    self.drop_finalizer(r)?;
                    let request = VolumeMountRequestSpec::resource_id(&self.mount_id);
                    if !r.teardown(&request).context("error tearing down mount request")? {
                        return Ok(false);
                    }
                    r.destroy(&request).context("error destroying mount request")?;
                    self.state = MountState::Released;
                }
                MountState::Released => {
                    if safe::get_opt::<VolumeMountStatusSpec, _>(r, &self.mount_id)?.is_some() {
                        return Ok(false);
                    }
                    debug!(mount = %self.mount_id, "volume mount cycle complete");
                    self.state = MountState::Idle;
                    self.status = None;
                    return Ok(true);
                }
            }
        }
    }

    /// Fast-forwards to `Released`: drops the finalizer and the request
    /// without waiting for the status to disappear.
    pub fn release(&mut self, r: &ControllerHandle) -> anyhow::Result<()> {
        if self.state == MountState::Idle || self.state == MountState::Released {
            return Ok(());
        }
        self.drop_finalizer(r)?;
        let request = VolumeMountRequestSpec::resource_id(&self.mount_id);
        match r.teardown(&request) {
            Ok(true) => r.destroy(&request).context("error destroying mount request")?,
            Ok(false) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context("error tearing down mount request"),
        }
        self.state = MountState::Released;
        self.status = None;
        Ok(())
    }

    fn drop_finalizer(&self, r: &ControllerHandle) -> anyhow::Result<()> {
        match r.remove_finalizer(&VolumeMountStatusSpec::resource_id(&self.mount_id), &self.requester) {
            Err(e) if !e.is_not_found() => Err(e).context("error removing finalizer"),
            _ => Ok(()),
        }
    }
}
