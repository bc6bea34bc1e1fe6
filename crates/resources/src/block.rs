//! Volume mount handshake between a requester and the mount controller.

use serde::Serialize;

pub const STATE_VOLUME_ID: &str = "STATE";

/// Mount request id shared by request and status: `<requester>-<volume>`.
pub fn mount_id(requester: &str, volume_id: &str) -> String { format!("{requester}-{volume_id}") }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeMountRequestSpec {
    pub volume_id: String,
    pub requester: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeMountStatusSpec {
    pub volume_id: String,
    pub requester: String,
    pub target: String,
    pub read_only: bool,
}
