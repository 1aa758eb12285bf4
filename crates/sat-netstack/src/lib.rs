//! Satellite Network Stack
//!
//! Static IPv4 model used by the beam and handover machinery:
//!
//! - Nodes, net devices and IPv4 interfaces (arena owned by [`Network`])
//! - Permanent ARP caches with a reverse MAC index
//! - Static routing tables
//! - Sequential address pools per link type (user, feeder, backbone)
//! - MAC to role directory (UT / GW / satellite / beam ids)
//! - Channel pairs carrying shared propagation-delay handles
//!
//! Everything here runs inside a single simulation event; nothing is
//! locked and nothing yields.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

use ipnetwork::Ipv4Network;

pub mod address;
pub mod arp;
pub mod channel;
pub mod directory;
pub mod network;
pub mod routing;

pub use address::{AddressPool, AddressPoolConfig};
pub use arp::{ArpCache, ArpEntry};
pub use channel::{
    ChannelPair, ConstantPropagationDelay, DelayHandle, LinkKind, PropagationDelayModel,
    SatChannel, TimingAdvance, DEFAULT_PROPAGATION_DELAY_S,
};
pub use directory::{IdDirectory, Role, RoleDirectory, SharedDirectory};
pub use network::{
    DeviceId, DeviceKind, Ipv4Interface, Ipv4InterfaceAddress, NetDevice, Network, Node, NodeId,
    NodeKind, NodeSnapshot,
};
pub use routing::{StaticRoute, StaticRouting};

/// Network stack errors
#[derive(Error, Debug, Clone)]
pub enum NetStackError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),
    #[error("Node {0} has no IPv4 stack installed")]
    NoIpv4Stack(NodeId),
    #[error("Device {0} is not bound to an IPv4 interface")]
    DeviceNotBound(DeviceId),
    #[error("Interface {index} not found on {node}")]
    InterfaceNotFound { node: NodeId, index: u32 },
    #[error("Device {0} has no IPv4 address")]
    NoAddress(DeviceId),
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("Address pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("MAC {mac} already attached as {existing}")]
    DuplicateAttachment { mac: Mac48Address, existing: String },
}

pub type Result<T> = std::result::Result<T, NetStackError>;

/// 48-bit link-layer address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac48Address([u8; 6]);

impl Mac48Address {
    pub const ZERO: Mac48Address = Mac48Address([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Address derived from a sequential allocation index (low 48 bits)
    pub fn from_index(index: u64) -> Self {
        let b = index.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac48Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for Mac48Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Mac48Address {
    type Err = NetStackError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetStackError::InvalidMac(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| NetStackError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetStackError::InvalidMac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for Mac48Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mac48Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Netmask for a prefix length, as a host-order integer
pub fn prefix_mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0)
}

/// Network containing `addr` for the given prefix, with host bits cleared
pub fn subnet(addr: Ipv4Addr, prefix: u8) -> Result<Ipv4Network> {
    let masked = Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix));
    Ipv4Network::new(masked, prefix).map_err(|e| NetStackError::InvalidNetwork(e.to_string()))
}

/// Prefix length of a contiguous netmask
pub fn mask_to_prefix(mask: Ipv4Addr) -> Result<u8> {
    let raw = u32::from(mask);
    let prefix = raw.leading_ones() as u8;
    if prefix_mask(prefix) != raw {
        return Err(NetStackError::InvalidNetwork(format!(
            "non-contiguous mask {}",
            mask
        )));
    }
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac = Mac48Address::from_index(0x0102);
        assert_eq!(mac.to_string(), "00:00:00:00:01:02");
        assert_eq!("00:00:00:00:01:02".parse::<Mac48Address>().unwrap(), mac);
        assert!("00:00:00:01:02".parse::<Mac48Address>().is_err());
        assert!("00:00:00:00:01:02:03".parse::<Mac48Address>().is_err());
        assert!("zz:00:00:00:01:02".parse::<Mac48Address>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let mac = Mac48Address::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"de:ad:be:ef:00:01\"");
        let back: Mac48Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_subnet_and_masks() {
        let net = subnet(Ipv4Addr::new(10, 1, 2, 3), 24).unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(net.prefix(), 24);

        assert_eq!(prefix_mask(0), 0);
        assert_eq!(prefix_mask(32), u32::MAX);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)).unwrap(), 16);
        assert!(mask_to_prefix(Ipv4Addr::new(255, 0, 255, 0)).is_err());
    }
}
