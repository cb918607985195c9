//! IP-based admission control for tunnel connections
//!
//! The gate combines a denylist and an allowlist of addresses or CIDR ranges.
//! A peer on the denylist is always refused; otherwise an empty allowlist
//! admits everyone and a non-empty one admits only listed peers.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Gate errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IpGateError {
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

/// An IP network in CIDR form; a bare address is a /32 (or /128) network
#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    fn parse(s: &str) -> Result<Self, IpGateError> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str)
                .map_err(|_| IpGateError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = prefix_str
                .parse::<u8>()
                .map_err(|_| IpGateError::InvalidCidr(s.to_string()))?;

            let max_prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_len > max_prefix {
                return Err(IpGateError::InvalidCidr(s.to_string()));
            }

            Ok(Self { addr, prefix_len })
        } else {
            let addr =
                IpAddr::from_str(s).map_err(|_| IpGateError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self { addr, prefix_len })
        }
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net_ip), IpAddr::V4(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u32::from(net_ip);
                let test_bits = u32::from(*test_ip);
                let mask = !0u32 << (32 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            (IpAddr::V6(net_ip), IpAddr::V6(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u128::from(net_ip);
                let test_bits = u128::from(*test_ip);
                let mask = !0u128 << (128 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            // IPv4 and IPv6 never match each other
            _ => false,
        }
    }
}

/// Admission gate consulted before a connection context is created.
///
/// The denylist wins over the allowlist. With both lists empty the gate
/// admits every peer, which is the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpGate {
    allowlist: Vec<String>,
    denylist: Vec<String>,
    allow_networks: Vec<IpNetwork>,
    deny_networks: Vec<IpNetwork>,
}

impl IpGate {
    /// Create a gate that admits all peers
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build a gate from allow and deny entries (IPs or CIDR ranges)
    pub fn from_rules(
        allowlist: Vec<String>,
        denylist: Vec<String>,
    ) -> Result<Self, IpGateError> {
        let allow_networks = allowlist
            .iter()
            .map(|s| IpNetwork::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        let deny_networks = denylist
            .iter()
            .map(|s| IpNetwork::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowlist,
            denylist,
            allow_networks,
            deny_networks,
        })
    }

    /// Check whether a peer IP is admitted
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        if self.deny_networks.iter().any(|net| net.contains(ip)) {
            return false;
        }
        if self.allow_networks.is_empty() {
            return true;
        }
        self.allow_networks.iter().any(|net| net.contains(ip))
    }

    /// Check a full socket address (the port is ignored)
    pub fn is_socket_allowed(&self, addr: &SocketAddr) -> bool {
        self.is_allowed(&addr.ip())
    }

    pub fn is_empty(&self) -> bool {
        self.allowlist.is_empty() && self.denylist.is_empty()
    }
}
