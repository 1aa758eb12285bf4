//! ISL topology and forwarding-table computation
//!
//! Satellites are graph nodes indexed by satellite id (0..n), ISLs are
//! undirected unit-cost edges. A neighbour `b` of `a` is a next hop
//! towards `t` when `dist(b, t) == dist(a, t) - 1`; when several
//! neighbours qualify the one whose ISL was declared first is kept.

use crate::{IslError, IslUnicastArbiter, Result, MAX_SATELLITES};
use petgraph::algo::dijkstra;
use petgraph::graph::{NodeIndex, UnGraph};
use sat_netstack::SharedDirectory;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Hop distance matrix; `None` when unreachable
pub type Distances = Vec<Vec<Option<u32>>>;

#[derive(Debug, Clone)]
pub struct IslTopology {
    graph: UnGraph<u32, ()>,
    nodes: Vec<NodeIndex>,
    isls: Vec<(u32, u32)>,
}

impl IslTopology {
    pub fn new(satellites: usize, isls: &[(u32, u32)]) -> Result<Self> {
        if satellites > MAX_SATELLITES {
            return Err(IslError::TooManySatellites {
                count: satellites,
                max: MAX_SATELLITES,
            });
        }

        let mut graph = UnGraph::with_capacity(satellites, isls.len());
        let nodes = (0..satellites as u32).map(|id| graph.add_node(id)).collect();
        let mut topology = Self {
            graph,
            nodes,
            isls: Vec::new(),
        };
        topology.set_isls(isls)?;
        Ok(topology)
    }

    fn set_isls(&mut self, isls: &[(u32, u32)]) -> Result<()> {
        for &(a, b) in isls {
            if a == b {
                return Err(IslError::SelfLoop(a));
            }
            self.index(a)?;
            self.index(b)?;
        }

        self.graph.clear_edges();
        for &(a, b) in isls {
            self.graph.add_edge(self.index(a)?, self.index(b)?, ());
        }
        self.isls = isls.to_vec();
        info!(
            "ISL topology: {} satellites, {} links",
            self.nodes.len(),
            self.isls.len()
        );
        Ok(())
    }

    fn index(&self, sat_id: u32) -> Result<NodeIndex> {
        self.nodes
            .get(sat_id as usize)
            .copied()
            .ok_or(IslError::UnknownSatellite(sat_id))
    }

    pub fn satellite_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn isls(&self) -> &[(u32, u32)] {
        &self.isls
    }

    /// Peer satellite of each ISL device on `sat_id`; the position is the
    /// local interface index (declaration order of the ISLs)
    pub fn interfaces(&self, sat_id: u32) -> Result<Vec<u32>> {
        self.index(sat_id)?;
        Ok(self
            .isls
            .iter()
            .filter_map(|&(a, b)| {
                if a == sat_id {
                    Some(b)
                } else if b == sat_id {
                    Some(a)
                } else {
                    None
                }
            })
            .collect())
    }

    /// All-pairs hop distances
    pub fn distances(&self) -> Distances {
        let n = self.nodes.len();
        self.nodes
            .iter()
            .map(|&source| {
                let reached = dijkstra(&self.graph, source, None, |_| 1u32);
                let mut row = vec![None; n];
                for (node, hops) in reached {
                    row[node.index()] = Some(hops);
                }
                row
            })
            .collect()
    }

    /// Per satellite, destination id -> next-hop satellite id
    pub fn global_state(&self) -> Vec<BTreeMap<u32, u32>> {
        let dist = self.distances();
        let n = self.nodes.len();
        let mut state = vec![BTreeMap::new(); n];

        let on_shortest_path = |from: u32, via: u32, target: usize| -> bool {
            match (dist[from as usize][target], dist[via as usize][target]) {
                (Some(d_from), Some(d_via)) => d_from == d_via + 1,
                _ => false,
            }
        };

        for &(a, b) in &self.isls {
            for target in 0..n {
                if on_shortest_path(a, b, target) {
                    state[a as usize].entry(target as u32).or_insert(b);
                }
                if on_shortest_path(b, a, target) {
                    state[b as usize].entry(target as u32).or_insert(a);
                }
            }
        }
        state
    }

    /// One arbiter per satellite, in satellite id order
    pub fn build_arbiters(&self, directory: &SharedDirectory) -> Result<Vec<IslUnicastArbiter>> {
        let state = self.global_state();
        let mut arbiters = Vec::with_capacity(state.len());

        for (sat, next_hops) in state.iter().enumerate() {
            let sat_id = sat as u32;
            let peers = self.interfaces(sat_id)?;
            let mut arbiter = IslUnicastArbiter::new(sat_id, Arc::clone(directory));
            for (interface, peer) in peers.iter().enumerate() {
                for (&destination, &next_hop) in next_hops {
                    if next_hop == *peer {
                        arbiter.add_next_hop_entry(destination, interface as u32);
                    }
                }
            }
            debug!("sat {}: {} forwarding entries", sat_id, arbiter.len());
            arbiters.push(arbiter);
        }
        Ok(arbiters)
    }

    /// Replace the ISL set and rebuild every arbiter
    pub fn update(
        &mut self,
        isls: &[(u32, u32)],
        directory: &SharedDirectory,
    ) -> Result<Vec<IslUnicastArbiter>> {
        self.set_isls(isls)?;
        self.build_arbiters(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IslArbiter, IslPacket, ROUTING_FAILURE};
    use proptest::prelude::*;
    use sat_netstack::IdDirectory;

    fn directory() -> SharedDirectory {
        Arc::new(IdDirectory::new())
    }

    #[test]
    fn test_line_distances() {
        let topo = IslTopology::new(4, &[(0, 1), (1, 2), (2, 3)]).unwrap();
        let dist = topo.distances();
        assert_eq!(dist[0][3], Some(3));
        assert_eq!(dist[2][2], Some(0));
        assert_eq!(dist[3][1], Some(2));
    }

    #[test]
    fn test_ring_tables() {
        // 0 - 1 - 2 - 3 - 0
        let topo = IslTopology::new(4, &[(0, 1), (1, 2), (2, 3), (3, 0)]).unwrap();
        assert_eq!(topo.interfaces(0).unwrap(), vec![1, 3]);

        let arbiters = topo.build_arbiters(&directory()).unwrap();
        let packet = IslPacket::default();
        let sat0 = &arbiters[0];
        assert_eq!(sat0.decide(0, 1, &packet), 0);
        assert_eq!(sat0.decide(0, 3, &packet), 1);
        // equal cost both ways, first declared ISL wins
        assert_eq!(sat0.decide(0, 2, &packet), 0);
        assert_eq!(sat0.decide(0, 0, &packet), ROUTING_FAILURE);
    }

    #[test]
    fn test_disconnected_satellite() {
        let topo = IslTopology::new(3, &[(0, 1)]).unwrap();
        let arbiters = topo.build_arbiters(&directory()).unwrap();
        assert_eq!(arbiters[0].decide(0, 2, &IslPacket::default()), ROUTING_FAILURE);
        assert!(arbiters[2].is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(
            IslTopology::new(2, &[(0, 0)]).unwrap_err(),
            IslError::SelfLoop(0)
        );
        assert_eq!(
            IslTopology::new(2, &[(0, 2)]).unwrap_err(),
            IslError::UnknownSatellite(2)
        );
        assert!(matches!(
            IslTopology::new(MAX_SATELLITES + 1, &[]),
            Err(IslError::TooManySatellites { .. })
        ));
    }

    #[test]
    fn test_update_recomputes_tables() {
        let dir = directory();
        let mut topo = IslTopology::new(3, &[(0, 1), (1, 2)]).unwrap();
        let before = topo.build_arbiters(&dir).unwrap();
        assert_eq!(before[0].decide(0, 2, &IslPacket::default()), 0);

        let after = topo.update(&[(0, 1), (0, 2)], &dir).unwrap();
        assert_eq!(after[0].decide(0, 2, &IslPacket::default()), 1);
        assert_eq!(topo.isls().len(), 2);
    }

    proptest! {
        // following the decided interfaces always reaches the target in
        // exactly dist hops
        #[test]
        fn forwarding_follows_shortest_paths(
            edges in proptest::collection::vec((0u32..8, 0u32..8), 0..20)
        ) {
            let isls: Vec<(u32, u32)> = edges.into_iter().filter(|(a, b)| a != b).collect();
            let topo = IslTopology::new(8, &isls).unwrap();
            let dist = topo.distances();
            let arbiters = topo.build_arbiters(&directory()).unwrap();
            let packet = IslPacket::default();

            for src in 0u32..8 {
                for dst in 0u32..8 {
                    if src == dst {
                        continue;
                    }
                    let mut current = src;
                    let mut hops = 0u32;
                    loop {
                        let interface = arbiters[current as usize].decide(src, dst, &packet);
                        if interface == ROUTING_FAILURE {
                            break;
                        }
                        current = topo.interfaces(current).unwrap()[interface as usize];
                        hops += 1;
                        if current == dst || hops > 8 {
                            break;
                        }
                    }
                    match dist[src as usize][dst as usize] {
                        Some(d) => {
                            prop_assert_eq!(current, dst);
                            prop_assert_eq!(hops, d);
                        }
                        None => prop_assert_eq!(hops, 0),
                    }
                }
            }
        }
    }
}
