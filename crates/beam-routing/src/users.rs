//! User LANs and the terrestrial side of the gateways
//!
//! Terminal users hang off a LAN on their terminal. Gateway users hang
//! off a LAN on the router: the gateway itself when there is only one,
//! otherwise a dedicated router node with one backbone LAN per gateway.

use crate::{BeamError, Result};
use sat_netstack::{
    AddressPool, AddressPoolConfig, DeviceKind, IdDirectory, Network, NodeId, NodeKind,
    StaticRoute,
};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Terrestrial side of the gateways
#[derive(Debug, Clone)]
pub struct GatewayBackbone {
    pub router: NodeId,
    /// `false` when the single gateway acts as its own router
    pub dedicated: bool,
    pub gateways: Vec<NodeId>,
    pub users: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct UserNetworkProvisioner {
    ut_pool: AddressPool,
    gw_pool: AddressPool,
}

impl UserNetworkProvisioner {
    pub fn new(ut_pool: AddressPool, gw_pool: AddressPool) -> Self {
        Self { ut_pool, gw_pool }
    }

    pub fn from_config(ut: &AddressPoolConfig, gw: &AddressPoolConfig) -> Result<Self> {
        Ok(Self::new(
            AddressPool::from_config(ut)?,
            AddressPool::from_config(gw)?,
        ))
    }

    /// One LAN per terminal with `count` users behind it. The terminal
    /// gets the first address, users default-route to it.
    pub fn install_ut_users(
        &mut self,
        network: &mut Network,
        directory: &mut IdDirectory,
        terminals: &[NodeId],
        count: usize,
    ) -> Result<Vec<NodeId>> {
        let mut all_users = Vec::with_capacity(terminals.len() * count);
        for terminal in terminals {
            let ut_dev = network.add_device(*terminal, DeviceKind::Lan)?;
            let mut devices = vec![ut_dev];
            let mut users = Vec::with_capacity(count);
            for _ in 0..count {
                let user = network.create_node(
                    NodeKind::TerminalUser,
                    format!("ut-user-{}", all_users.len() + users.len() + 1),
                );
                network.install_ipv4(user)?;
                let dev = network.add_device(user, DeviceKind::Lan)?;
                directory.attach_terminal_user(network.device(dev)?.mac)?;
                devices.push(dev);
                users.push(user);
            }

            let addresses = self.ut_pool.assign(network, &devices)?;
            for (user, dev) in users.iter().zip(&devices[1..]) {
                let index = network.interface_for_device(*dev)?;
                network
                    .routing_mut(*user)?
                    .set_default_route(Some(addresses[0]), index);
            }
            debug!("{}: {} users behind {}", terminal, users.len(), addresses[0]);

            all_users.extend(users);
            self.ut_pool.new_network()?;
        }
        info!("installed {} terminal users", all_users.len());
        Ok(all_users)
    }

    /// Wire the gateways to a router and put `count` users behind it
    pub fn install_gw_users(
        &mut self,
        network: &mut Network,
        directory: &mut IdDirectory,
        gateways: &[NodeId],
        count: usize,
    ) -> Result<GatewayBackbone> {
        let (router, dedicated) = match gateways {
            [] => {
                return Err(BeamError::InvalidScenario(
                    "no gateways to attach users to".to_string(),
                ))
            }
            [single] => (*single, false),
            _ => {
                let router = network.create_node(NodeKind::Router, "router");
                network.install_ipv4(router)?;
                for gateway in gateways {
                    self.install_backbone_link(network, *gateway, router)?;
                }
                (router, true)
            }
        };

        let router_dev = network.add_device(router, DeviceKind::Lan)?;
        let mut devices = vec![router_dev];
        let mut users = Vec::with_capacity(count);
        for i in 0..count {
            let user = network.create_node(NodeKind::GatewayUser, format!("gw-user-{}", i + 1));
            network.install_ipv4(user)?;
            let dev = network.add_device(user, DeviceKind::Lan)?;
            directory.attach_gateway_user(network.device(dev)?.mac)?;
            devices.push(dev);
            users.push(user);
        }

        let addresses = self.gw_pool.assign(network, &devices)?;
        for (user, dev) in users.iter().zip(&devices[1..]) {
            let index = network.interface_for_device(*dev)?;
            network
                .routing_mut(*user)?
                .set_default_route(Some(addresses[0]), index);
        }
        self.gw_pool.new_network()?;

        info!(
            "installed {} gateway users behind {} ({})",
            users.len(),
            router,
            if dedicated { "dedicated router" } else { "gateway" }
        );
        Ok(GatewayBackbone {
            router,
            dedicated,
            gateways: gateways.to_vec(),
            users,
        })
    }

    fn install_backbone_link(
        &mut self,
        network: &mut Network,
        gateway: NodeId,
        router: NodeId,
    ) -> Result<()> {
        let gw_dev = network.add_device(gateway, DeviceKind::Lan)?;
        let router_dev = network.add_device(router, DeviceKind::Lan)?;
        let addresses = self.gw_pool.assign(network, &[gw_dev, router_dev])?;
        let (gw_addr, router_addr) = (addresses[0], addresses[1]);

        let gw_if = network.interface_for_device(gw_dev)?;
        network
            .routing_mut(gateway)?
            .set_default_route(Some(router_addr), gw_if);

        // anchor: tells the router which interface faces this gateway
        let router_if = network.interface_for_device(router_dev)?;
        network
            .routing_mut(router)?
            .add_host_route(gw_addr, Some(gw_addr), router_if);

        debug!("backbone {} <-> {} ({} / {})", gateway, router, gw_addr, router_addr);
        self.gw_pool.new_network()?;
        Ok(())
    }
}

/// Give every gateway without a default route an on-link default through
/// its first terrestrial interface
pub fn set_routes_for_gws(network: &mut Network, gateways: &[NodeId]) -> Result<()> {
    for gateway in gateways {
        if network.routing(*gateway)?.default_route().is_some() {
            continue;
        }
        let first = network
            .interfaces(*gateway)?
            .iter()
            .enumerate()
            .find_map(|(index, iface)| {
                let kind = network.device(iface.device()).ok()?.kind;
                (kind == DeviceKind::Lan && iface.address().is_some()).then_some(index as u32)
            });
        if let Some(index) = first {
            network.routing_mut(*gateway)?.set_default_route(None, index);
            debug!("{}: default route on-link via if {}", gateway, index);
        }
    }
    Ok(())
}

/// Backbone address of `gateway` (its default route's interface) and the
/// router interface facing it
pub(crate) fn backbone_link(
    network: &Network,
    gateway: NodeId,
    router: NodeId,
) -> Option<(Ipv4Addr, u32)> {
    let default = network.routing(gateway).ok()?.default_route()?;
    let gw_addr = network
        .interface(gateway, default.interface)
        .ok()?
        .address()?
        .local;
    let router_if = network
        .routing(router)
        .ok()?
        .routes_via(gw_addr)
        .next()?
        .interface;
    Some((gw_addr, router_if))
}

/// Mirror on the dedicated router every route a gateway holds towards a
/// terminal network, next hop the gateway's backbone address. Returns the
/// number of routes added.
pub fn mirror_gateway_routes(network: &mut Network, backbone: &GatewayBackbone) -> Result<usize> {
    if !backbone.dedicated {
        return Ok(0);
    }
    let mut added = 0;
    for gateway in &backbone.gateways {
        let (gw_addr, router_if) =
            backbone_link(network, *gateway, backbone.router).ok_or_else(|| {
                BeamError::InvalidScenario(format!(
                    "{} has no backbone link to {}",
                    gateway, backbone.router
                ))
            })?;

        let mut mirrors = Vec::new();
        for route in network.routing(*gateway)?.routes() {
            if route.gateway.is_none() || route.is_host() || route.is_default() {
                continue;
            }
            let towards_satellite = network
                .interface(*gateway, route.interface)
                .and_then(|iface| network.device(iface.device()))?
                .kind
                .is_satellite();
            if towards_satellite {
                mirrors.push(StaticRoute::new(route.destination, Some(gw_addr), router_if));
            }
        }

        let router_routing = network.routing_mut(backbone.router)?;
        for mirror in mirrors {
            if !router_routing.contains(&mirror) {
                debug!("{}: mirror {}", backbone.router, mirror);
                router_routing.add_route(mirror);
                added += 1;
            }
        }
    }
    info!("mirrored {} gateway routes on {}", added, backbone.router);
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner() -> UserNetworkProvisioner {
        UserNetworkProvisioner::from_config(
            &AddressPoolConfig::ut_default(),
            &AddressPoolConfig::gw_default(),
        )
        .unwrap()
    }

    fn node(net: &mut Network, kind: NodeKind, name: &str) -> NodeId {
        let id = net.create_node(kind, name);
        net.install_ipv4(id).unwrap();
        id
    }

    #[test]
    fn test_ut_users_default_to_terminal() {
        let mut net = Network::new();
        let mut dir = IdDirectory::new();
        let ut_1 = node(&mut net, NodeKind::Terminal, "ut-1");
        let ut_2 = node(&mut net, NodeKind::Terminal, "ut-2");

        let users = provisioner()
            .install_ut_users(&mut net, &mut dir, &[ut_1, ut_2], 2)
            .unwrap();
        assert_eq!(users.len(), 4);
        assert_eq!(dir.len(), 4);

        let third = net.routing(users[2]).unwrap().default_route().unwrap();
        assert_eq!(third.gateway, Some(Ipv4Addr::new(10, 1, 1, 1)));
        assert_eq!(
            net.address_of(net.node(ut_2).unwrap().devices()[1]).unwrap().local,
            Ipv4Addr::new(10, 1, 1, 1)
        );
    }

    #[test]
    fn test_single_gateway_is_router() {
        let mut net = Network::new();
        let mut dir = IdDirectory::new();
        let gw = node(&mut net, NodeKind::Gateway, "gw-1");

        let backbone = provisioner()
            .install_gw_users(&mut net, &mut dir, &[gw], 1)
            .unwrap();
        assert_eq!(backbone.router, gw);
        assert!(!backbone.dedicated);

        set_routes_for_gws(&mut net, &[gw]).unwrap();
        let default = net.routing(gw).unwrap().default_route().unwrap();
        assert_eq!(default.gateway, None);
        assert_eq!(default.interface, 1);
        assert_eq!(mirror_gateway_routes(&mut net, &backbone).unwrap(), 0);
    }

    #[test]
    fn test_dedicated_router_anchors() {
        let mut net = Network::new();
        let mut dir = IdDirectory::new();
        let gw_a = node(&mut net, NodeKind::Gateway, "gw-1");
        let gw_b = node(&mut net, NodeKind::Gateway, "gw-2");

        let backbone = provisioner()
            .install_gw_users(&mut net, &mut dir, &[gw_a, gw_b], 1)
            .unwrap();
        assert!(backbone.dedicated);

        // gw-2 backbone is the second block
        let gw_b_addr = Ipv4Addr::new(90, 1, 1, 1);
        let default_b = net.routing(gw_b).unwrap().default_route().unwrap();
        assert_eq!(default_b.gateway, Some(Ipv4Addr::new(90, 1, 1, 2)));
        assert_eq!(
            backbone_link(&net, gw_b, backbone.router).unwrap().0,
            gw_b_addr
        );

        // defaults already set, nothing changes
        set_routes_for_gws(&mut net, &[gw_a, gw_b]).unwrap();
        assert_eq!(
            net.routing(gw_b).unwrap().default_route().unwrap().gateway,
            Some(Ipv4Addr::new(90, 1, 1, 2))
        );

        let user = net.routing(backbone.users[0]).unwrap().default_route().unwrap();
        assert_eq!(user.gateway, Some(Ipv4Addr::new(90, 1, 2, 1)));
    }

    #[test]
    fn test_mirror_copies_satellite_routes() {
        let mut net = Network::new();
        let mut dir = IdDirectory::new();
        let gw_a = node(&mut net, NodeKind::Gateway, "gw-1");
        let gw_b = node(&mut net, NodeKind::Gateway, "gw-2");
        let sat = net.add_device(gw_a, DeviceKind::Satellite { beam_id: 1 }).unwrap();
        net.assign_address(sat, Ipv4Addr::new(40, 1, 0, 1), 24).unwrap();
        let sat_if = net.interface_for_device(sat).unwrap();
        let ut_lan = sat_netstack::subnet(Ipv4Addr::new(10, 1, 0, 0), 24).unwrap();
        net.routing_mut(gw_a)
            .unwrap()
            .add_network_route(ut_lan, Some(Ipv4Addr::new(40, 1, 0, 2)), sat_if);

        let backbone = provisioner()
            .install_gw_users(&mut net, &mut dir, &[gw_a, gw_b], 0)
            .unwrap();
        assert_eq!(mirror_gateway_routes(&mut net, &backbone).unwrap(), 1);
        // second pass adds nothing
        assert_eq!(mirror_gateway_routes(&mut net, &backbone).unwrap(), 0);

        let mirror = net
            .routing(backbone.router)
            .unwrap()
            .lookup(Ipv4Addr::new(10, 1, 0, 7))
            .unwrap();
        assert_eq!(mirror.gateway, Some(Ipv4Addr::new(90, 1, 0, 1)));
    }
}
