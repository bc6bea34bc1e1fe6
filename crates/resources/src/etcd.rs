use std::net::IpAddr;

use serde::Serialize;

pub const ETCD_SPEC_ID: &str = "etcd";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EtcdSpec {
    pub name: String,
    pub advertised_addresses: Vec<IpAddr>,
    pub listen_peer_addresses: Vec<IpAddr>,
    pub listen_client_addresses: Vec<IpAddr>,
}
