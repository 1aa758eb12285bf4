//! Node / device / interface arena
//!
//! Every node and device lives in a [`Network`] and is addressed by a
//! small integer id. Devices get a sequential MAC on creation and the
//! network keeps the MAC -> device index used by the handover code.

use crate::arp::ArpCache;
use crate::channel::TimingAdvance;
use crate::routing::{StaticRoute, StaticRouting};
use crate::{subnet, Mac48Address, NetStackError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Terminal,
    Gateway,
    /// Terrestrial router shared by several gateways
    Router,
    TerminalUser,
    GatewayUser,
    Satellite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Loopback,
    /// Spot-beam device; `beam_id` is the beam currently served
    Satellite { beam_id: u32 },
    /// Terrestrial LAN / backbone
    Lan,
    /// On-board payload device of a satellite, owner of its beams
    Payload,
    /// Inter-satellite link
    Isl,
}

impl DeviceKind {
    pub fn is_satellite(&self) -> bool {
        matches!(self, DeviceKind::Satellite { .. })
    }

    pub fn beam_id(&self) -> Option<u32> {
        match self {
            DeviceKind::Satellite { beam_id } => Some(*beam_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetDevice {
    pub id: DeviceId,
    pub node: NodeId,
    pub kind: DeviceKind,
    pub mac: Mac48Address,
    pub timing_advance: TimingAdvance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4InterfaceAddress {
    pub local: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4InterfaceAddress {
    pub fn subnet(&self) -> Result<Ipv4Network> {
        subnet(self.local, self.prefix)
    }
}

impl fmt::Display for Ipv4InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.local, self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct Ipv4Interface {
    device: DeviceId,
    addresses: Vec<Ipv4InterfaceAddress>,
    arp: ArpCache,
}

impl Ipv4Interface {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            addresses: Vec::new(),
            arp: ArpCache::new(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn addresses(&self) -> &[Ipv4InterfaceAddress] {
        &self.addresses
    }

    pub fn address(&self) -> Option<&Ipv4InterfaceAddress> {
        self.addresses.first()
    }

    pub fn arp(&self) -> &ArpCache {
        &self.arp
    }

    pub fn arp_mut(&mut self) -> &mut ArpCache {
        &mut self.arp
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ipv4Stack {
    interfaces: Vec<Ipv4Interface>,
    routing: StaticRouting,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    devices: Vec<DeviceId>,
    ipv4: Option<Ipv4Stack>,
}

impl Node {
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn has_ipv4(&self) -> bool {
        self.ipv4.is_some()
    }
}

/// Serializable view of one node's IPv4 state
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub interfaces: Vec<InterfaceSnapshot>,
    pub routes: Vec<StaticRoute>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSnapshot {
    pub index: u32,
    pub device: DeviceKind,
    pub mac: Mac48Address,
    pub addresses: Vec<String>,
    pub arp: Vec<ArpSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArpSnapshot {
    pub address: Ipv4Addr,
    pub mac: Mac48Address,
    pub permanent: bool,
}

#[derive(Debug, Default)]
pub struct Network {
    nodes: Vec<Node>,
    devices: Vec<NetDevice>,
    by_mac: HashMap<Mac48Address, DeviceId>,
    next_mac: u64,
}

impl Network {
    pub fn new() -> Self {
        Self {
            next_mac: 1,
            ..Self::default()
        }
    }

    pub fn create_node(&mut self, kind: NodeKind, name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind,
            devices: Vec::new(),
            ipv4: None,
        });
        id
    }

    /// Install the IPv4 stack. Interface 0 is the loopback; devices added
    /// before the stack get their interfaces here, in device order.
    pub fn install_ipv4(&mut self, node: NodeId) -> Result<()> {
        if self.node(node)?.has_ipv4() {
            return Ok(());
        }
        let loopback = self.push_device(node, DeviceKind::Loopback, Mac48Address::ZERO);
        let existing: Vec<DeviceId> = self.node(node)?.devices.clone();

        let mut stack = Ipv4Stack::default();
        stack.interfaces.push(Ipv4Interface::new(loopback));
        for dev in existing.into_iter().filter(|d| *d != loopback) {
            stack.interfaces.push(Ipv4Interface::new(dev));
        }
        stack.interfaces[0].addresses.push(Ipv4InterfaceAddress {
            local: Ipv4Addr::LOCALHOST,
            prefix: 8,
        });

        let n = self.node_mut(node)?;
        n.devices.retain(|d| *d != loopback);
        n.devices.insert(0, loopback);
        n.ipv4 = Some(stack);
        Ok(())
    }

    /// Create a device on `node` with a fresh MAC. When the node has an
    /// IPv4 stack an interface is bound to the device immediately.
    pub fn add_device(&mut self, node: NodeId, kind: DeviceKind) -> Result<DeviceId> {
        self.node(node)?;
        let mac = Mac48Address::from_index(self.next_mac);
        self.next_mac += 1;
        let id = self.push_device(node, kind, mac);
        self.by_mac.insert(mac, id);

        if let Some(stack) = self.node_mut(node)?.ipv4.as_mut() {
            stack.interfaces.push(Ipv4Interface::new(id));
        }
        debug!("created {} ({:?}, {}) on {}", id, kind, mac, node);
        Ok(id)
    }

    fn push_device(&mut self, node: NodeId, kind: DeviceKind, mac: Mac48Address) -> DeviceId {
        let id = DeviceId(self.devices.len() as u32);
        self.devices.push(NetDevice {
            id,
            node,
            kind,
            mac,
            timing_advance: TimingAdvance::default(),
        });
        if let Some(n) = self.nodes.get_mut(node.0 as usize) {
            n.devices.push(id);
        }
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(NetStackError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(NetStackError::NodeNotFound(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn device(&self, id: DeviceId) -> Result<&NetDevice> {
        self.devices
            .get(id.0 as usize)
            .ok_or(NetStackError::DeviceNotFound(id))
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Result<&mut NetDevice> {
        self.devices
            .get_mut(id.0 as usize)
            .ok_or(NetStackError::DeviceNotFound(id))
    }

    pub fn device_by_mac(&self, mac: &Mac48Address) -> Option<DeviceId> {
        self.by_mac.get(mac).copied()
    }

    fn stack(&self, node: NodeId) -> Result<&Ipv4Stack> {
        self.node(node)?
            .ipv4
            .as_ref()
            .ok_or(NetStackError::NoIpv4Stack(node))
    }

    fn stack_mut(&mut self, node: NodeId) -> Result<&mut Ipv4Stack> {
        self.node_mut(node)?
            .ipv4
            .as_mut()
            .ok_or(NetStackError::NoIpv4Stack(node))
    }

    pub fn interfaces(&self, node: NodeId) -> Result<&[Ipv4Interface]> {
        Ok(&self.stack(node)?.interfaces)
    }

    pub fn interface(&self, node: NodeId, index: u32) -> Result<&Ipv4Interface> {
        self.stack(node)?
            .interfaces
            .get(index as usize)
            .ok_or(NetStackError::InterfaceNotFound { node, index })
    }

    pub fn interface_mut(&mut self, node: NodeId, index: u32) -> Result<&mut Ipv4Interface> {
        self.stack_mut(node)?
            .interfaces
            .get_mut(index as usize)
            .ok_or(NetStackError::InterfaceNotFound { node, index })
    }

    pub fn routing(&self, node: NodeId) -> Result<&StaticRouting> {
        Ok(&self.stack(node)?.routing)
    }

    pub fn routing_mut(&mut self, node: NodeId) -> Result<&mut StaticRouting> {
        Ok(&mut self.stack_mut(node)?.routing)
    }

    pub fn arp_cache(&self, node: NodeId, index: u32) -> Result<&ArpCache> {
        Ok(self.interface(node, index)?.arp())
    }

    pub fn arp_cache_mut(&mut self, node: NodeId, index: u32) -> Result<&mut ArpCache> {
        Ok(self.interface_mut(node, index)?.arp_mut())
    }

    pub fn interface_for_device(&self, device: DeviceId) -> Result<u32> {
        let node = self.device(device)?.node;
        self.stack(node)?
            .interfaces
            .iter()
            .position(|i| i.device == device)
            .map(|p| p as u32)
            .ok_or(NetStackError::DeviceNotBound(device))
    }

    /// Add an address to the device's interface and install the matching
    /// on-link route.
    pub fn assign_address(&mut self, device: DeviceId, local: Ipv4Addr, prefix: u8) -> Result<()> {
        let node = self.device(device)?.node;
        let index = self.interface_for_device(device)?;
        let address = Ipv4InterfaceAddress { local, prefix };
        let network = address.subnet()?;

        let stack = self.stack_mut(node)?;
        stack.interfaces[index as usize].addresses.push(address);
        stack.routing.add_network_route(network, None, index);
        debug!("assigned {} to {} (if {} on {})", address, device, index, node);
        Ok(())
    }

    pub fn address_of(&self, device: DeviceId) -> Result<Ipv4InterfaceAddress> {
        let node = self.device(device)?.node;
        let index = self.interface_for_device(device)?;
        self.interface(node, index)?
            .address()
            .copied()
            .ok_or(NetStackError::NoAddress(device))
    }

    /// Node and interface index owning `address`
    pub fn node_by_address(&self, address: Ipv4Addr) -> Option<(NodeId, u32)> {
        self.nodes.iter().find_map(|n| {
            let stack = n.ipv4.as_ref()?;
            stack
                .interfaces
                .iter()
                .position(|i| i.addresses.iter().any(|a| a.local == address))
                .map(|p| (n.id, p as u32))
        })
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.nodes
            .iter()
            .filter_map(|n| {
                let stack = n.ipv4.as_ref()?;
                let interfaces = stack
                    .interfaces
                    .iter()
                    .enumerate()
                    .filter_map(|(index, iface)| {
                        let dev = self.devices.get(iface.device.0 as usize)?;
                        Some(InterfaceSnapshot {
                            index: index as u32,
                            device: dev.kind,
                            mac: dev.mac,
                            addresses: iface.addresses.iter().map(|a| a.to_string()).collect(),
                            arp: iface
                                .arp
                                .iter()
                                .map(|(address, e)| ArpSnapshot {
                                    address,
                                    mac: e.mac,
                                    permanent: e.permanent,
                                })
                                .collect(),
                        })
                    })
                    .collect();
                Some(NodeSnapshot {
                    id: n.id,
                    name: n.name.clone(),
                    kind: n.kind,
                    interfaces,
                    routes: stack.routing.routes().to_vec(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_binds_devices_in_order() {
        let mut net = Network::new();
        let node = net.create_node(NodeKind::Terminal, "ut-1");
        let lan = net.add_device(node, DeviceKind::Lan).unwrap();
        net.install_ipv4(node).unwrap();
        let sat = net.add_device(node, DeviceKind::Satellite { beam_id: 1 }).unwrap();

        assert_eq!(net.interface_for_device(lan).unwrap(), 1);
        assert_eq!(net.interface_for_device(sat).unwrap(), 2);
        assert_eq!(net.interfaces(node).unwrap().len(), 3);
        assert_eq!(
            net.interface(node, 0).unwrap().address().unwrap().local,
            Ipv4Addr::LOCALHOST
        );
    }

    #[test]
    fn test_assign_installs_connected_route() {
        let mut net = Network::new();
        let node = net.create_node(NodeKind::Gateway, "gw-1");
        net.install_ipv4(node).unwrap();
        let dev = net.add_device(node, DeviceKind::Satellite { beam_id: 1 }).unwrap();
        net.assign_address(dev, Ipv4Addr::new(40, 1, 0, 1), 24).unwrap();

        let routes = net.routing(node).unwrap().routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination.network(), Ipv4Addr::new(40, 1, 0, 0));
        assert_eq!(routes[0].gateway, None);
        assert_eq!(routes[0].interface, 1);
        assert_eq!(net.node_by_address(Ipv4Addr::new(40, 1, 0, 1)), Some((node, 1)));
    }

    #[test]
    fn test_mac_index() {
        let mut net = Network::new();
        let node = net.create_node(NodeKind::Gateway, "gw-1");
        let a = net.add_device(node, DeviceKind::Lan).unwrap();
        let b = net.add_device(node, DeviceKind::Lan).unwrap();
        let mac_a = net.device(a).unwrap().mac;
        let mac_b = net.device(b).unwrap().mac;

        assert_ne!(mac_a, mac_b);
        assert_eq!(net.device_by_mac(&mac_b), Some(b));
        assert_eq!(net.device_by_mac(&Mac48Address::ZERO), None);
    }

    #[test]
    fn test_missing_stack_and_address() {
        let mut net = Network::new();
        let node = net.create_node(NodeKind::Satellite, "sat-0");
        let dev = net.add_device(node, DeviceKind::Isl).unwrap();

        assert!(matches!(net.routing(node), Err(NetStackError::NoIpv4Stack(_))));
        net.install_ipv4(node).unwrap();
        assert!(matches!(net.address_of(dev), Err(NetStackError::NoAddress(_))));
    }
}
