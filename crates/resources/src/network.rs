//! Network status kinds and probe definitions.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const NODE_ADDRESS_CURRENT_ID: &str = "current";
pub const HOSTNAME_STATUS_ID: &str = "hostname";
pub const NETWORK_STATUS_ID: &str = "status";
pub const TIME_SERVER_STATUS_ID: &str = "timeservers";

/// Address with prefix length, `10.2.1.3/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid prefix {0:?}")]
pub struct PrefixParseError(String);

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, PrefixParseError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max { return Err(PrefixParseError(format!("{addr}/{len}"))); }
        Ok(Self { addr, len })
    }

    pub fn addr(&self) -> IpAddr { self.addr }
    pub fn prefix_len(&self) -> u8 { self.len }
}

impl FromStr for IpPrefix {
    type Err = PrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| PrefixParseError(s.to_string()))?;
        let len = match len {
            Some(l) => l.parse::<u8>().map_err(|_| PrefixParseError(s.to_string()))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        Self::new(addr, len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = PrefixParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<IpPrefix> for String {
    fn from(p: IpPrefix) -> String { p.to_string() }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.addr, self.len) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum OperState {
    #[default]
    Unknown,
    Down,
    Up,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatusSpec {
    pub index: u32,
    pub hardware_addr: String,
    pub mtu: u32,
    pub oper_state: OperState,
}

impl LinkStatusSpec {
    pub fn is_up(&self) -> bool { self.oper_state == OperState::Up }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeAddressSpec {
    pub addresses: Vec<IpPrefix>,
}

impl NodeAddressSpec {
    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ { self.addresses.iter().map(|p| p.addr()) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostnameStatusSpec {
    pub hostname: String,
    pub domainname: String,
}

impl HostnameStatusSpec {
    /// `hostname.domain` when a domain is present, else `hostname`.
    pub fn fqdn(&self) -> String {
        if self.domainname.is_empty() { self.hostname.clone() } else { format!("{}.{}", self.hostname, self.domainname) }
    }

    /// Hostname label at most 63 bytes, FQDN at most 253.
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() { return Err("hostname can't be empty".into()); }
        if self.hostname.len() > 63 { return Err(format!("hostname {:?} is too long: {}", self.hostname, self.hostname.len())); }
        if self.hostname.contains('.') { return Err(format!("hostname {:?} must be a single label", self.hostname)); }
        let fqdn = self.fqdn();
        if fqdn.len() > 253 { return Err(format!("fqdn {fqdn:?} is too long: {}", fqdn.len())); }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStatusSpec {
    pub address_ready: bool,
    pub connectivity_ready: bool,
    pub hostname_ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TcpProbeSpec {
    pub endpoint: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSpec {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub tcp: TcpProbeSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStatusSpec {
    pub success: bool,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeServerStatusSpec {
    pub ntp_servers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parse() {
        let p: IpPrefix = "10.2.1.3/24".parse().unwrap();
        assert_eq!(p.prefix_len(), 24);
        assert_eq!(p.to_string(), "10.2.1.3/24");
        assert_eq!("fd00::1".parse::<IpPrefix>().unwrap().prefix_len(), 128);
        assert!("10.0.0.1/33".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn hostname_validation() {
        let ok = HostnameStatusSpec { hostname: "foo".into(), domainname: "example.com".into() };
        assert_eq!(ok.fqdn(), "foo.example.com");
        assert!(ok.validate().is_ok());
        let long = HostnameStatusSpec { hostname: "a".repeat(64), domainname: String::new() };
        assert!(long.validate().is_err());
    }
}
