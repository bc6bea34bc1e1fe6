use std::net::IpAddr;

use serde::Serialize;

/// Endpoints of control plane nodes serving certificate issuance.
pub const CONTROL_PLANE_ENDPOINTS_ID: &str = "control-plane";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointSpec {
    pub addresses: Vec<IpAddr>,
}
