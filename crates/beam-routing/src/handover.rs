//! Handover route convergence
//!
//! When a terminal changes serving gateway (or beam on the same gateway)
//! its default route and neighbour entry, the gateway routes towards it
//! and, behind a dedicated router, the router's mirrored routes all have
//! to move together. Each update is first computed read-only as a
//! [`ConvergencePlan`], checked against the network, then applied in a
//! single pass. A failed lookup leaves the network untouched.
//!
//! The router mirrors the terminal's terrestrial networks only. Host
//! routes towards a terminal's satellite address stay on the gateways.

use crate::channels::BeamDelays;
use ipnetwork::Ipv4Network;
use sat_netstack::{
    DelayHandle, DeviceId, DeviceKind, Mac48Address, NetStackError, Network, NodeId, NodeKind,
    Role, RoleDirectory, StaticRoute,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Handover convergence errors
#[derive(Error, Debug, Clone)]
pub enum ConvergenceError {
    #[error("Unknown link-layer address: {0}")]
    UnknownAddress(Mac48Address),
    #[error("{mac} is not a {expected}")]
    RoleMismatch {
        mac: Mac48Address,
        expected: &'static str,
    },
    #[error("Router {router} has no route for {destination}")]
    MissingMirrorRoute {
        router: NodeId,
        destination: Ipv4Network,
    },
    #[error("{0} is not a satellite-facing device")]
    NoSatelliteInterface(Mac48Address),
    #[error("Gateway {0} has no terrestrial interface")]
    NoTerrestrialInterface(NodeId),
    #[error("Handover already in progress for terminal {0}")]
    HandoverInProgress(Mac48Address),
    #[error("No serving gateway known for terminal {0}")]
    NotServed(Mac48Address),
    #[error("No propagation delay models for beam {0}")]
    UnknownBeam(u32),
    #[error("Network stack error: {0}")]
    NetStack(#[from] NetStackError),
}

pub type Result<T> = std::result::Result<T, ConvergenceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoverKind {
    /// Same gateway node, different beam / interface
    IntraGateway,
    /// Different gateway node
    InterGateway,
}

impl fmt::Display for HandoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoverKind::IntraGateway => write!(f, "intra-gateway"),
            HandoverKind::InterGateway => write!(f, "inter-gateway"),
        }
    }
}

/// One state change of a convergence step
#[derive(Debug, Clone)]
pub enum Mutation {
    ArpInsert {
        node: NodeId,
        interface: u32,
        address: Ipv4Addr,
        mac: Mac48Address,
    },
    /// Drop every entry on the interface resolving to `mac`
    ArpPurge {
        node: NodeId,
        interface: u32,
        mac: Mac48Address,
    },
    RouteRemove {
        node: NodeId,
        route: StaticRoute,
    },
    RouteAdd {
        node: NodeId,
        route: StaticRoute,
    },
    DefaultRoute {
        node: NodeId,
        gateway: Ipv4Addr,
        interface: u32,
    },
    RebindBeam {
        device: DeviceId,
        beam_id: u32,
    },
    TimingAdvance {
        device: DeviceId,
        forward_feeder: DelayHandle,
        return_user: DelayHandle,
    },
}

impl Mutation {
    fn check(&self, network: &Network) -> std::result::Result<(), NetStackError> {
        match self {
            Mutation::ArpInsert {
                node, interface, ..
            }
            | Mutation::ArpPurge {
                node, interface, ..
            }
            | Mutation::DefaultRoute {
                node, interface, ..
            } => {
                network.interface(*node, *interface)?;
            }
            Mutation::RouteAdd { node, route } => {
                network.interface(*node, route.interface)?;
            }
            Mutation::RouteRemove { node, .. } => {
                network.routing(*node)?;
            }
            Mutation::RebindBeam { device, .. } | Mutation::TimingAdvance { device, .. } => {
                network.device(*device)?;
            }
        }
        Ok(())
    }

    fn apply(&self, network: &mut Network) -> std::result::Result<(), NetStackError> {
        match self {
            Mutation::ArpInsert {
                node,
                interface,
                address,
                mac,
            } => {
                if network
                    .arp_cache_mut(*node, *interface)?
                    .add_permanent(*address, *mac)
                {
                    debug!("{} if {}: arp {} -> {}", node, interface, address, mac);
                }
            }
            Mutation::ArpPurge {
                node,
                interface,
                mac,
            } => {
                let removed = network.arp_cache_mut(*node, *interface)?.remove_by_mac(mac);
                debug!("{} if {}: arp purge {} ({:?})", node, interface, mac, removed);
            }
            Mutation::RouteRemove { node, route } => {
                network.routing_mut(*node)?.remove_route(route);
                debug!("{}: removed {}", node, route);
            }
            Mutation::RouteAdd { node, route } => {
                network.routing_mut(*node)?.add_route(*route);
                debug!("{}: added {}", node, route);
            }
            Mutation::DefaultRoute {
                node,
                gateway,
                interface,
            } => {
                network
                    .routing_mut(*node)?
                    .set_default_route(Some(*gateway), *interface);
                debug!("{}: default via {} if {}", node, gateway, interface);
            }
            Mutation::RebindBeam { device, beam_id } => {
                network.device_mut(*device)?.kind = DeviceKind::Satellite { beam_id: *beam_id };
            }
            Mutation::TimingAdvance {
                device,
                forward_feeder,
                return_user,
            } => {
                network
                    .device_mut(*device)?
                    .timing_advance
                    .set_delay_models(forward_feeder.clone(), return_user.clone());
            }
        }
        Ok(())
    }
}

/// Ordered list of mutations computed against one network state
#[derive(Debug, Clone, Default)]
pub struct ConvergencePlan {
    mutations: Vec<Mutation>,
}

impl ConvergencePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn extend(&mut self, other: ConvergencePlan) {
        self.mutations.extend(other.mutations);
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Every node, interface and device the plan touches exists
    pub fn validate(&self, network: &Network) -> Result<()> {
        for mutation in &self.mutations {
            mutation.check(network)?;
        }
        Ok(())
    }

    /// Validate, then apply every mutation in order
    pub fn apply(self, network: &mut Network) -> Result<usize> {
        self.validate(network)?;
        for mutation in &self.mutations {
            mutation.apply(network)?;
        }
        Ok(self.mutations.len())
    }
}

/// A satellite-facing device resolved from its MAC
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    mac: Mac48Address,
    device: DeviceId,
    node: NodeId,
    interface: u32,
    beam_id: u32,
}

#[derive(Debug, Clone, Copy)]
enum Expect {
    Terminal,
    Gateway,
}

impl Expect {
    fn matches(self, role: &Role) -> bool {
        match self {
            Expect::Terminal => matches!(role, Role::Terminal { .. }),
            Expect::Gateway => matches!(role, Role::Gateway { .. }),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Expect::Terminal => "terminal",
            Expect::Gateway => "gateway",
        }
    }
}

/// Plans and applies handovers. Overlap between handovers of one terminal
/// is refused upstream by the handover queue.
pub struct HandoverRouteConvergence<D> {
    directory: D,
}

impl<D: RoleDirectory> HandoverRouteConvergence<D> {
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    fn endpoint(&self, network: &Network, mac: &Mac48Address, expect: Expect) -> Result<Endpoint> {
        let role = self
            .directory
            .resolve(mac)
            .ok_or(ConvergenceError::UnknownAddress(*mac))?;
        if !expect.matches(&role) {
            return Err(ConvergenceError::RoleMismatch {
                mac: *mac,
                expected: expect.name(),
            });
        }

        let device = network
            .device_by_mac(mac)
            .ok_or(ConvergenceError::UnknownAddress(*mac))?;
        let dev = network.device(device)?;
        let beam_id = dev
            .kind
            .beam_id()
            .ok_or(ConvergenceError::NoSatelliteInterface(*mac))?;
        Ok(Endpoint {
            mac: *mac,
            device,
            node: dev.node,
            interface: network.interface_for_device(device)?,
            beam_id,
        })
    }

    /// Terminal side: neighbour entry and default route towards the new
    /// gateway, beam binding and timing-advance delay handles. Entries for
    /// gateways that no longer serve the terminal are dropped.
    pub fn plan_terminal_route(
        &self,
        network: &Network,
        delays: &dyn BeamDelays,
        terminal: &Mac48Address,
        gateway: &Mac48Address,
    ) -> Result<ConvergencePlan> {
        let ut = self.endpoint(network, terminal, Expect::Terminal)?;
        let gw = self.endpoint(network, gateway, Expect::Gateway)?;
        let gw_addr = network.address_of(gw.device)?.local;

        let beam_id = self.directory.beam_id(gateway).unwrap_or(gw.beam_id);
        let (forward_feeder, return_user) = delays
            .delay_models(beam_id)
            .ok_or(ConvergenceError::UnknownBeam(beam_id))?;

        let stale: BTreeSet<Mac48Address> = network
            .arp_cache(ut.node, ut.interface)?
            .iter()
            .map(|(_, entry)| entry.mac)
            .filter(|mac| *mac != gw.mac)
            .collect();

        let mut plan = ConvergencePlan::new();
        for mac in stale {
            plan.push(Mutation::ArpPurge {
                node: ut.node,
                interface: ut.interface,
                mac,
            });
        }
        plan.push(Mutation::ArpInsert {
            node: ut.node,
            interface: ut.interface,
            address: gw_addr,
            mac: gw.mac,
        });
        plan.push(Mutation::DefaultRoute {
            node: ut.node,
            gateway: gw_addr,
            interface: ut.interface,
        });
        plan.push(Mutation::RebindBeam {
            device: ut.device,
            beam_id,
        });
        plan.push(Mutation::TimingAdvance {
            device: ut.device,
            forward_feeder,
            return_user,
        });
        Ok(plan)
    }

    pub fn update_terminal_route(
        &mut self,
        network: &mut Network,
        delays: &dyn BeamDelays,
        terminal: &Mac48Address,
        gateway: &Mac48Address,
    ) -> Result<()> {
        let applied = self
            .plan_terminal_route(network, delays, terminal, gateway)?
            .apply(network)?;
        debug!("terminal {} now routed via {} ({} changes)", terminal, gateway, applied);
        Ok(())
    }

    /// Gateway and router side of moving `terminal` from `old_gateway` to
    /// `new_gateway`
    pub fn plan_gateway_route(
        &self,
        network: &Network,
        terminal: &Mac48Address,
        old_gateway: &Mac48Address,
        new_gateway: &Mac48Address,
    ) -> Result<(ConvergencePlan, HandoverKind)> {
        let ut = self.endpoint(network, terminal, Expect::Terminal)?;
        let old = self.endpoint(network, old_gateway, Expect::Gateway)?;
        let new = self.endpoint(network, new_gateway, Expect::Gateway)?;
        let ut_addr = network.address_of(ut.device)?.local;

        let mut plan = ConvergencePlan::new();

        for (index, iface) in network.interfaces(old.node)?.iter().enumerate() {
            if !iface.arp().lookup_inverse(terminal).is_empty() {
                plan.push(Mutation::ArpPurge {
                    node: old.node,
                    interface: index as u32,
                    mac: *terminal,
                });
            }
        }
        plan.push(Mutation::ArpInsert {
            node: new.node,
            interface: new.interface,
            address: ut_addr,
            mac: *terminal,
        });

        let stale: Vec<StaticRoute> = network
            .routing(old.node)?
            .routes_via(ut_addr)
            .copied()
            .collect();
        for route in &stale {
            plan.push(Mutation::RouteRemove {
                node: old.node,
                route: *route,
            });
        }

        let fresh = terminal_routes(network, &ut, ut_addr, &new)?;
        for route in &fresh {
            plan.push(Mutation::RouteAdd {
                node: new.node,
                route: *route,
            });
        }

        if old.node == new.node {
            return Ok((plan, HandoverKind::IntraGateway));
        }

        if let Some(router) = router_of(network, old.node)? {
            let routing = network.routing(router)?;
            for route in stale.iter().filter(|r| !r.is_host()) {
                let mirrors: Vec<StaticRoute> = routing
                    .routes()
                    .iter()
                    .filter(|m| m.same_destination(route))
                    .copied()
                    .collect();
                if mirrors.is_empty() {
                    return Err(ConvergenceError::MissingMirrorRoute {
                        router,
                        destination: route.destination,
                    });
                }
                for mirror in mirrors {
                    plan.push(Mutation::RouteRemove {
                        node: router,
                        route: mirror,
                    });
                }
            }
        }

        if let Some(router) = router_of(network, new.node)? {
            let gw_addr = terrestrial_address(network, new.node)?;
            let router_if = network
                .routing(router)?
                .routes_via(gw_addr)
                .next()
                .map(|r| r.interface)
                .ok_or(ConvergenceError::MissingMirrorRoute {
                    router,
                    destination: Ipv4Network::from(gw_addr),
                })?;
            for route in fresh.iter().filter(|r| !r.is_host()) {
                plan.push(Mutation::RouteAdd {
                    node: router,
                    route: StaticRoute::new(route.destination, Some(gw_addr), router_if),
                });
            }
        }

        Ok((plan, HandoverKind::InterGateway))
    }

    pub fn update_gateway_route(
        &mut self,
        network: &mut Network,
        terminal: &Mac48Address,
        old_gateway: &Mac48Address,
        new_gateway: &Mac48Address,
    ) -> Result<HandoverKind> {
        let (plan, kind) = self.plan_gateway_route(network, terminal, old_gateway, new_gateway)?;
        plan.apply(network)?;
        Ok(kind)
    }

    /// Gateway side and terminal side of one handover, applied as a
    /// single plan
    pub fn handover(
        &mut self,
        network: &mut Network,
        delays: &dyn BeamDelays,
        terminal: &Mac48Address,
        old_gateway: &Mac48Address,
        new_gateway: &Mac48Address,
    ) -> Result<HandoverKind> {
        let result = self.converge(network, delays, terminal, old_gateway, new_gateway);
        if let Err(e) = &result {
            warn!("handover of {} rejected: {}", terminal, e);
        }
        result
    }

    fn converge(
        &self,
        network: &mut Network,
        delays: &dyn BeamDelays,
        terminal: &Mac48Address,
        old_gateway: &Mac48Address,
        new_gateway: &Mac48Address,
    ) -> Result<HandoverKind> {
        let (mut plan, kind) =
            self.plan_gateway_route(network, terminal, old_gateway, new_gateway)?;
        plan.extend(self.plan_terminal_route(network, delays, terminal, new_gateway)?);
        let applied = plan.apply(network)?;

        info!(
            "{} handover of UT {:?} ({}): GW {:?} -> GW {:?}, {} changes",
            kind,
            self.directory.terminal_id(terminal),
            terminal,
            self.directory.gateway_id(old_gateway),
            self.directory.gateway_id(new_gateway),
            applied
        );
        Ok(kind)
    }
}

/// Routes the new gateway needs towards the terminal: one per addressed
/// interface, in interface order. The satellite address gets a host route
/// unless the new gateway interface is already on its subnet.
fn terminal_routes(
    network: &Network,
    ut: &Endpoint,
    ut_addr: Ipv4Addr,
    new: &Endpoint,
) -> Result<Vec<StaticRoute>> {
    let covered = network
        .address_of(new.device)?
        .subnet()?
        .contains(ut_addr);

    let mut routes = Vec::new();
    for iface in network.interfaces(ut.node)? {
        let kind = network.device(iface.device())?.kind;
        let Some(address) = iface.address() else {
            continue;
        };
        let destination = match kind {
            DeviceKind::Loopback => continue,
            DeviceKind::Satellite { .. } if covered => continue,
            DeviceKind::Satellite { .. } => Ipv4Network::from(address.local),
            _ => address.subnet()?,
        };
        routes.push(StaticRoute::new(destination, Some(ut_addr), new.interface));
    }
    Ok(routes)
}

/// Dedicated router a gateway's default route points at
fn router_of(network: &Network, gateway: NodeId) -> Result<Option<NodeId>> {
    let next_hop = match network
        .routing(gateway)?
        .default_route()
        .and_then(|r| r.gateway)
    {
        Some(next_hop) => next_hop,
        None => return Ok(None),
    };
    match network.node_by_address(next_hop) {
        Some((node, _)) if network.node(node)?.kind == NodeKind::Router => Ok(Some(node)),
        _ => Ok(None),
    }
}

/// Address of the first addressed terrestrial interface of a gateway
fn terrestrial_address(network: &Network, gateway: NodeId) -> Result<Ipv4Addr> {
    for iface in network.interfaces(gateway)? {
        if network.device(iface.device())?.kind != DeviceKind::Lan {
            continue;
        }
        if let Some(address) = iface.address() {
            return Ok(address.local);
        }
    }
    Err(ConvergenceError::NoTerrestrialInterface(gateway))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::BeamChannelProvisioner;
    use crate::provision::BeamRouteProvisioner;
    use proptest::prelude::*;
    use sat_netstack::{AddressPoolConfig, ConstantPropagationDelay, IdDirectory};

    /// One gateway with two beams, one terminal with a LAN on beam 1
    struct Fixture {
        net: Network,
        channels: BeamChannelProvisioner,
        convergence: HandoverRouteConvergence<IdDirectory>,
        gw: NodeId,
        ut: NodeId,
        ut_mac: Mac48Address,
        beam_1: Mac48Address,
        beam_2: Mac48Address,
    }

    fn fixture() -> Fixture {
        let mut net = Network::new();
        let mut channels =
            BeamChannelProvisioner::new(&mut net, ConstantPropagationDelay::default()).unwrap();
        let mut beams =
            BeamRouteProvisioner::from_config(&AddressPoolConfig::beam_default()).unwrap();
        let mut dir = IdDirectory::new();

        let ut = net.create_node(NodeKind::Terminal, "ut-1");
        net.install_ipv4(ut).unwrap();
        let lan = net.add_device(ut, DeviceKind::Lan).unwrap();
        net.assign_address(lan, Ipv4Addr::new(10, 1, 0, 1), 24).unwrap();

        let gw = channels.install_beam(&mut net, 1, 1, 1, 1).unwrap().gw_node;
        channels.install_beam(&mut net, 2, 1, 2, 2).unwrap();
        let gw_dev_1 = net.add_device(gw, DeviceKind::Satellite { beam_id: 1 }).unwrap();
        let gw_dev_2 = net.add_device(gw, DeviceKind::Satellite { beam_id: 2 }).unwrap();
        let ut_dev = net.add_device(ut, DeviceKind::Satellite { beam_id: 1 }).unwrap();

        beams.provision_beam(&mut net, &[ut], &[ut_dev], gw, gw_dev_1).unwrap();
        beams.provision_beam(&mut net, &[], &[], gw, gw_dev_2).unwrap();

        let ut_mac = net.device(ut_dev).unwrap().mac;
        let beam_1 = net.device(gw_dev_1).unwrap().mac;
        let beam_2 = net.device(gw_dev_2).unwrap().mac;
        dir.attach_terminal(ut_mac).unwrap();
        dir.attach_gateway(beam_1, 1).unwrap();
        dir.attach_gateway(beam_2, 1).unwrap();
        dir.attach_beam(beam_1, 1).unwrap();
        dir.attach_beam(beam_2, 2).unwrap();

        Fixture {
            net,
            channels,
            convergence: HandoverRouteConvergence::new(dir),
            gw,
            ut,
            ut_mac,
            beam_1,
            beam_2,
        }
    }

    type RouteKey = (Ipv4Addr, u8, Option<Ipv4Addr>, u32);

    fn sorted_routes(net: &Network, node: NodeId) -> Vec<RouteKey> {
        let mut routes: Vec<RouteKey> = net
            .routing(node)
            .unwrap()
            .routes()
            .iter()
            .map(|r| (r.destination.network(), r.destination.prefix(), r.gateway, r.interface))
            .collect();
        routes.sort();
        routes
    }

    #[test]
    fn test_update_terminal_route_is_idempotent() {
        let mut f = fixture();
        let ut_dev = f.net.device_by_mac(&f.ut_mac).unwrap();
        let ut_if = f.net.interface_for_device(ut_dev).unwrap();
        let arp_of = |net: &Network| -> Vec<(Ipv4Addr, sat_netstack::ArpEntry)> {
            net.arp_cache(f.ut, ut_if)
                .unwrap()
                .iter()
                .map(|(ip, e)| (ip, *e))
                .collect()
        };

        f.convergence
            .update_terminal_route(&mut f.net, &f.channels, &f.ut_mac, &f.beam_2)
            .unwrap();
        let routes = f.net.routing(f.ut).unwrap().routes().to_vec();
        let arp = arp_of(&f.net);

        f.convergence
            .update_terminal_route(&mut f.net, &f.channels, &f.ut_mac, &f.beam_2)
            .unwrap();
        assert_eq!(f.net.routing(f.ut).unwrap().routes(), routes.as_slice());
        assert_eq!(arp_of(&f.net), arp);

        let default = f.net.routing(f.ut).unwrap().default_route().unwrap();
        assert_eq!(default.gateway, Some(Ipv4Addr::new(40, 1, 1, 1)));
        let dev = f.net.device(ut_dev).unwrap();
        assert_eq!(dev.kind.beam_id(), Some(2));
        let (feeder, user) = f.channels.delay_models(2).unwrap();
        assert!(dev.timing_advance.uses(&feeder, &user));
    }

    #[test]
    fn test_intra_gateway_round_trip() {
        let mut f = fixture();
        let before = sorted_routes(&f.net, f.gw);

        let kind = f
            .convergence
            .handover(&mut f.net, &f.channels, &f.ut_mac, &f.beam_1, &f.beam_2)
            .unwrap();
        assert_eq!(kind, HandoverKind::IntraGateway);

        let ut_addr = Ipv4Addr::new(40, 1, 0, 2);
        let gw_if_2 = f
            .net
            .interface_for_device(f.net.device_by_mac(&f.beam_2).unwrap())
            .unwrap();
        let via: Vec<StaticRoute> = f.net.routing(f.gw).unwrap().routes_via(ut_addr).copied().collect();
        // LAN route plus host route for the out-of-subnet satellite address
        assert_eq!(via.len(), 2);
        assert!(via.iter().all(|r| r.interface == gw_if_2));
        assert!(via[1].is_host());
        assert_eq!(
            f.net.arp_cache(f.gw, gw_if_2).unwrap().lookup(ut_addr).unwrap().mac,
            f.ut_mac
        );

        f.convergence
            .handover(&mut f.net, &f.channels, &f.ut_mac, &f.beam_2, &f.beam_1)
            .unwrap();
        assert_eq!(sorted_routes(&f.net, f.gw), before);
    }

    #[test]
    fn test_terminal_keeps_only_serving_gateway_neighbour() {
        let mut f = fixture();
        let ut_if = f
            .net
            .interface_for_device(f.net.device_by_mac(&f.ut_mac).unwrap())
            .unwrap();
        let neighbours = |net: &Network| -> Vec<Mac48Address> {
            net.arp_cache(f.ut, ut_if)
                .unwrap()
                .iter()
                .map(|(_, e)| e.mac)
                .collect()
        };
        assert_eq!(neighbours(&f.net), vec![f.beam_1]);

        for (from, to) in [(f.beam_1, f.beam_2), (f.beam_2, f.beam_1), (f.beam_1, f.beam_2)] {
            f.convergence
                .handover(&mut f.net, &f.channels, &f.ut_mac, &from, &to)
                .unwrap();
            assert_eq!(neighbours(&f.net), vec![to]);
        }
    }

    #[test]
    fn test_unknown_mac_changes_nothing() {
        let mut f = fixture();
        let before = sorted_routes(&f.net, f.gw);
        let stranger = Mac48Address::from_index(0xdead);

        let err = f
            .convergence
            .handover(&mut f.net, &f.channels, &f.ut_mac, &f.beam_1, &stranger)
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::UnknownAddress(mac) if mac == stranger));
        assert_eq!(sorted_routes(&f.net, f.gw), before);
    }

    #[test]
    fn test_role_mismatch() {
        let mut f = fixture();
        let err = f
            .convergence
            .update_gateway_route(&mut f.net, &f.beam_1, &f.beam_1, &f.beam_2)
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergenceError::RoleMismatch { expected: "terminal", .. }
        ));
    }

    #[test]
    fn test_plan_is_read_only() {
        let f = fixture();
        let before = sorted_routes(&f.net, f.gw);
        let (plan, kind) = f
            .convergence
            .plan_gateway_route(&f.net, &f.ut_mac, &f.beam_1, &f.beam_2)
            .unwrap();
        assert_eq!(kind, HandoverKind::IntraGateway);
        assert!(!plan.is_empty());
        assert_eq!(sorted_routes(&f.net, f.gw), before);
    }

    #[test]
    fn test_invalid_plan_is_not_applied() {
        let mut f = fixture();
        let before = sorted_routes(&f.net, f.gw);
        let mut plan = ConvergencePlan::new();
        plan.push(Mutation::RouteRemove {
            node: f.gw,
            route: f.net.routing(f.gw).unwrap().routes()[0],
        });
        plan.push(Mutation::ArpInsert {
            node: f.gw,
            interface: 99,
            address: Ipv4Addr::new(40, 1, 0, 9),
            mac: f.ut_mac,
        });

        assert!(plan.apply(&mut f.net).is_err());
        assert_eq!(sorted_routes(&f.net, f.gw), before);
    }

    proptest! {
        // any sequence of beam switches, ending back on beam 1, restores
        // the gateway table and leaves exactly one interface serving the UT
        #[test]
        fn beam_switches_round_trip(moves in proptest::collection::vec(any::<bool>(), 0..8)) {
            let mut f = fixture();
            let before = sorted_routes(&f.net, f.gw);
            let mut serving = f.beam_1;

            for to_second in moves.into_iter().chain(std::iter::once(false)) {
                let target = if to_second { f.beam_2 } else { f.beam_1 };
                f.convergence
                    .handover(&mut f.net, &f.channels, &f.ut_mac, &serving, &target)
                    .unwrap();
                serving = target;

                let target_if = f
                    .net
                    .interface_for_device(f.net.device_by_mac(&target).unwrap())
                    .unwrap();
                let ut_addr = Ipv4Addr::new(40, 1, 0, 2);
                let routing = f.net.routing(f.gw).unwrap();
                prop_assert!(routing.routes_via(ut_addr).all(|r| r.interface == target_if));
                let holders: Vec<u32> = f
                    .net
                    .interfaces(f.gw)
                    .unwrap()
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| i.arp().lookup(ut_addr).is_some())
                    .map(|(index, _)| index as u32)
                    .collect();
                prop_assert_eq!(holders, vec![target_if]);
            }
            prop_assert_eq!(sorted_routes(&f.net, f.gw), before);
            prop_assert_eq!(
                f.net.routing(f.ut).unwrap().default_route().unwrap().gateway,
                Some(Ipv4Addr::new(40, 1, 0, 1))
            );
        }
    }
}
