//! Static IPv4 routing table
//!
//! Routes are kept in insertion order. Removal rebuilds the list with a
//! filter so that the routes that survive keep their relative order.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A single static route: destination network, optional next hop and
/// output interface index on the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub destination: Ipv4Network,
    /// `None` for on-link (connected) routes
    pub gateway: Option<Ipv4Addr>,
    pub interface: u32,
}

impl StaticRoute {
    pub fn new(destination: Ipv4Network, gateway: Option<Ipv4Addr>, interface: u32) -> Self {
        Self {
            destination,
            gateway,
            interface,
        }
    }

    pub fn host(address: Ipv4Addr, gateway: Option<Ipv4Addr>, interface: u32) -> Self {
        Self::new(Ipv4Network::from(address), gateway, interface)
    }

    pub fn default_via(gateway: Option<Ipv4Addr>, interface: u32) -> Self {
        Self::new(default_network(), gateway, interface)
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }

    pub fn is_host(&self) -> bool {
        self.destination.prefix() == 32
    }

    pub fn is_via(&self, next_hop: Ipv4Addr) -> bool {
        self.gateway == Some(next_hop)
    }

    /// Same destination network and mask
    pub fn same_destination(&self, other: &StaticRoute) -> bool {
        self.destination.network() == other.destination.network()
            && self.destination.prefix() == other.destination.prefix()
    }
}

impl fmt::Display for StaticRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(
                f,
                "{}/{} via {} if {}",
                self.destination.network(),
                self.destination.prefix(),
                gw,
                self.interface
            ),
            None => write!(
                f,
                "{}/{} on-link if {}",
                self.destination.network(),
                self.destination.prefix(),
                self.interface
            ),
        }
    }
}

fn default_network() -> Ipv4Network {
    // /0 is always a valid prefix
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::UNSPECIFIED))
}

/// Per-node static routing table
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaticRouting {
    routes: Vec<StaticRoute>,
}

impl StaticRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> &[StaticRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, route: &StaticRoute) -> bool {
        self.routes.contains(route)
    }

    pub fn add_route(&mut self, route: StaticRoute) {
        self.routes.push(route);
    }

    pub fn add_network_route(
        &mut self,
        destination: Ipv4Network,
        gateway: Option<Ipv4Addr>,
        interface: u32,
    ) {
        self.add_route(StaticRoute::new(destination, gateway, interface));
    }

    pub fn add_host_route(&mut self, address: Ipv4Addr, gateway: Option<Ipv4Addr>, interface: u32) {
        self.add_route(StaticRoute::host(address, gateway, interface));
    }

    /// Install the default route, replacing an existing one in place.
    /// Any further default routes are dropped so the table holds at most one.
    pub fn set_default_route(&mut self, gateway: Option<Ipv4Addr>, interface: u32) {
        let route = StaticRoute::default_via(gateway, interface);
        match self.routes.iter().position(StaticRoute::is_default) {
            Some(pos) => {
                self.routes[pos] = route;
                let mut seen = 0usize;
                self.routes.retain(|r| {
                    if r.is_default() {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.routes.push(route),
        }
    }

    pub fn default_route(&self) -> Option<&StaticRoute> {
        self.routes.iter().find(|r| r.is_default())
    }

    /// Remove every route matching `predicate`, returning them in table order
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<StaticRoute>
    where
        F: FnMut(&StaticRoute) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.routes.drain(..).partition(|r| predicate(r));
        self.routes = kept;
        removed
    }

    pub fn remove_route(&mut self, route: &StaticRoute) -> usize {
        self.remove_where(|r| r == route).len()
    }

    pub fn routes_via(&self, next_hop: Ipv4Addr) -> impl Iterator<Item = &StaticRoute> {
        self.routes.iter().filter(move |r| r.is_via(next_hop))
    }

    /// Longest-prefix match; the earliest route wins between equal prefixes
    pub fn lookup(&self, destination: Ipv4Addr) -> Option<&StaticRoute> {
        self.routes
            .iter()
            .filter(|r| r.destination.contains(destination))
            .fold(None, |best: Option<&StaticRoute>, r| match best {
                Some(b) if b.destination.prefix() >= r.destination.prefix() => Some(b),
                _ => Some(r),
            })
    }
}
