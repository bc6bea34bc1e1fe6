//! Network controllers: link and address status, hostname, time servers and
//! TCP reachability probes.

mod address;
mod hostname;
mod link;
pub mod probe;
mod timeservers;

pub use address::{NetworkStatusController, NodeAddressController};
pub use hostname::HostnameController;
pub use link::{LinkSource, LinkStatusController, SysfsLinkSource};
pub use probe::{tcp_probe, Notification, Probe, ProbeConfigController, ProbeController};
pub use timeservers::{TimeServerController, DEFAULT_TIME_SERVER};
