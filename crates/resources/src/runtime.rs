use serde::Serialize;

pub const DEVICES_STATUS_ID: &str = "devices";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DevicesStatusSpec {
    pub ready: bool,
}
