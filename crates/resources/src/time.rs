use serde::Serialize;

pub const TIME_STATUS_ID: &str = "node";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeStatusSpec {
    pub synced: bool,
    /// Bumped on every large clock jump.
    pub epoch: u64,
    pub sync_disabled: bool,
}
