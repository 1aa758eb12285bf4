//! Beam address, ARP and route provisioning
//!
//! Satellite hops do not carry broadcast ARP, so both ends of a beam get
//! permanent neighbour entries at activation time: the gateway learns
//! every terminal, every terminal learns the gateway.

use crate::{BeamError, Result};
use ipnetwork::Ipv4Network;
use sat_netstack::{
    AddressPool, AddressPoolConfig, ArpCache, DeviceId, DeviceKind, Network, NodeId, StaticRoute,
};
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Addresses handed out for one beam
#[derive(Debug, Clone, Serialize)]
pub struct BeamProvisioning {
    pub network: Ipv4Network,
    pub gateway_address: Ipv4Addr,
    pub terminal_addresses: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct BeamRouteProvisioner {
    pool: AddressPool,
}

impl BeamRouteProvisioner {
    pub fn new(pool: AddressPool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &AddressPoolConfig) -> Result<Self> {
        Ok(Self::new(AddressPool::from_config(config)?))
    }

    /// Address the beam, install the permanent ARP caches on both sides,
    /// the terminals' default routes and the gateway routes towards every
    /// terrestrial network behind the terminals. Consumes one network
    /// block of the pool.
    pub fn provision_beam(
        &mut self,
        network: &mut Network,
        terminals: &[NodeId],
        terminal_devices: &[DeviceId],
        gateway: NodeId,
        gateway_device: DeviceId,
    ) -> Result<BeamProvisioning> {
        if terminals.len() != terminal_devices.len() {
            return Err(BeamError::ContainerMismatch {
                terminals: terminals.len(),
                devices: terminal_devices.len(),
            });
        }
        for (node, device) in terminals
            .iter()
            .zip(terminal_devices)
            .chain(std::iter::once((&gateway, &gateway_device)))
        {
            if network.device(*device)?.node != *node {
                return Err(BeamError::ForeignDevice {
                    device: *device,
                    node: *node,
                });
            }
        }

        let block = self.pool.current_network()?;
        let gateway_address = self.pool.assign(network, &[gateway_device])?[0];
        let terminal_addresses = self.pool.assign(network, terminal_devices)?;

        let gw_if = network.interface_for_device(gateway_device)?;
        let gw_mac = network.device(gateway_device)?.mac;

        let mut ut_arp = ArpCache::new();
        ut_arp.add_permanent(gateway_address, gw_mac);

        for ((terminal, device), address) in terminals
            .iter()
            .zip(terminal_devices)
            .zip(&terminal_addresses)
        {
            let ut_mac = network.device(*device)?.mac;
            network
                .arp_cache_mut(gateway, gw_if)?
                .add_permanent(*address, ut_mac);

            let ut_if = network.interface_for_device(*device)?;
            network.arp_cache_mut(*terminal, ut_if)?.merge_permanent(&ut_arp);
            network
                .routing_mut(*terminal)?
                .set_default_route(Some(gateway_address), ut_if);

            for destination in terrestrial_networks(network, *terminal)? {
                let route = StaticRoute::new(destination, Some(*address), gw_if);
                debug!("{}: {}", gateway, route);
                network.routing_mut(gateway)?.add_route(route);
            }
        }

        self.pool.new_network()?;
        info!(
            "provisioned beam network {} ({} terminals, gateway {})",
            block,
            terminal_addresses.len(),
            gateway_address
        );

        Ok(BeamProvisioning {
            network: block,
            gateway_address,
            terminal_addresses,
        })
    }
}

/// Connected networks of every addressed non-satellite interface on `node`
pub(crate) fn terrestrial_networks(network: &Network, node: NodeId) -> Result<Vec<Ipv4Network>> {
    let mut networks = Vec::new();
    for iface in network.interfaces(node)?.iter() {
        let kind = network.device(iface.device())?.kind;
        if matches!(kind, DeviceKind::Loopback) || kind.is_satellite() {
            continue;
        }
        if let Some(address) = iface.address() {
            networks.push(address.subnet()?);
        }
    }
    Ok(networks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sat_netstack::NodeKind;

    struct Fixture {
        net: Network,
        gw: NodeId,
        gw_dev: DeviceId,
        uts: Vec<NodeId>,
        ut_devs: Vec<DeviceId>,
    }

    fn fixture(terminals: usize) -> Fixture {
        let mut net = Network::new();
        let gw = net.create_node(NodeKind::Gateway, "gw-1");
        net.install_ipv4(gw).unwrap();
        let gw_dev = net.add_device(gw, DeviceKind::Satellite { beam_id: 1 }).unwrap();

        let mut uts = Vec::new();
        let mut ut_devs = Vec::new();
        for i in 0..terminals {
            let ut = net.create_node(NodeKind::Terminal, format!("ut-{}", i + 1));
            net.install_ipv4(ut).unwrap();
            let lan = net.add_device(ut, DeviceKind::Lan).unwrap();
            net.assign_address(lan, Ipv4Addr::new(10, 1, i as u8, 1), 24).unwrap();
            ut_devs.push(net.add_device(ut, DeviceKind::Satellite { beam_id: 1 }).unwrap());
            uts.push(ut);
        }
        Fixture {
            net,
            gw,
            gw_dev,
            uts,
            ut_devs,
        }
    }

    fn provisioner() -> BeamRouteProvisioner {
        BeamRouteProvisioner::from_config(&AddressPoolConfig::beam_default()).unwrap()
    }

    #[test]
    fn test_one_gateway_three_terminals() {
        let mut f = fixture(3);
        let mut p = provisioner();
        let result = p
            .provision_beam(&mut f.net, &f.uts, &f.ut_devs, f.gw, f.gw_dev)
            .unwrap();

        assert_eq!(result.gateway_address, Ipv4Addr::new(40, 1, 0, 1));
        assert_eq!(result.terminal_addresses.len(), 3);

        let gw_if = f.net.interface_for_device(f.gw_dev).unwrap();
        assert_eq!(f.net.arp_cache(f.gw, gw_if).unwrap().len(), 3);

        for (ut, dev) in f.uts.iter().zip(&f.ut_devs) {
            let ut_if = f.net.interface_for_device(*dev).unwrap();
            let arp = f.net.arp_cache(*ut, ut_if).unwrap();
            assert_eq!(arp.len(), 1);
            assert!(arp.lookup(result.gateway_address).unwrap().permanent);

            let routing = f.net.routing(*ut).unwrap();
            assert_eq!(routing.routes().iter().filter(|r| r.is_default()).count(), 1);
            assert_eq!(
                routing.default_route().unwrap().gateway,
                Some(result.gateway_address)
            );
        }
    }

    #[test]
    fn test_gateway_routes_to_terminal_lans() {
        let mut f = fixture(2);
        let mut p = provisioner();
        let result = p
            .provision_beam(&mut f.net, &f.uts, &f.ut_devs, f.gw, f.gw_dev)
            .unwrap();

        let gw_routing = f.net.routing(f.gw).unwrap();
        let lan_2 = gw_routing
            .lookup(Ipv4Addr::new(10, 1, 1, 20))
            .unwrap();
        assert_eq!(lan_2.gateway, Some(result.terminal_addresses[1]));
        assert_eq!(lan_2.interface, f.net.interface_for_device(f.gw_dev).unwrap());
        // connected beam route plus one per terminal LAN
        assert_eq!(gw_routing.len(), 3);
    }

    #[test]
    fn test_consecutive_beams_use_new_blocks() {
        let mut f = fixture(1);
        let mut p = provisioner();
        let first = p
            .provision_beam(&mut f.net, &f.uts, &f.ut_devs, f.gw, f.gw_dev)
            .unwrap();

        let gw_dev = f.net.add_device(f.gw, DeviceKind::Satellite { beam_id: 2 }).unwrap();
        let second = p.provision_beam(&mut f.net, &[], &[], f.gw, gw_dev).unwrap();

        assert_eq!(first.network.network(), Ipv4Addr::new(40, 1, 0, 0));
        assert_eq!(second.network.network(), Ipv4Addr::new(40, 1, 1, 0));
        assert_eq!(second.gateway_address, Ipv4Addr::new(40, 1, 1, 1));
    }

    #[test]
    fn test_mismatched_containers() {
        let mut f = fixture(2);
        let mut p = provisioner();
        let err = p
            .provision_beam(&mut f.net, &f.uts, &f.ut_devs[..1], f.gw, f.gw_dev)
            .unwrap_err();
        assert!(matches!(
            err,
            BeamError::ContainerMismatch { terminals: 2, devices: 1 }
        ));
        // nothing was assigned
        assert!(f.net.address_of(f.gw_dev).is_err());
    }

    #[test]
    fn test_foreign_device_rejected() {
        let mut f = fixture(2);
        let mut p = provisioner();
        let swapped = [f.ut_devs[1], f.ut_devs[0]];
        assert!(matches!(
            p.provision_beam(&mut f.net, &f.uts, &swapped, f.gw, f.gw_dev),
            Err(BeamError::ForeignDevice { .. })
        ));
    }
}
