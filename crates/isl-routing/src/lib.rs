//! ISL Routing
//!
//! Per-packet forwarding decisions across inter-satellite links:
//!
//! - [`IslArbiter`] contract (decide on satellite ids, or on a
//!   destination MAC through the role directory)
//! - [`IslUnicastArbiter`], a fixed destination -> interface table
//! - [`IslTopology`], which computes those tables from the ISL set

use sat_netstack::{Mac48Address, RoleDirectory, SharedDirectory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

pub mod topology;

pub use topology::IslTopology;

/// Largest constellation the topology code accepts
pub const MAX_SATELLITES: usize = 40_000;

/// Returned by [`IslArbiter::decide`] when no interface leads to the target
pub const ROUTING_FAILURE: i32 = -1;

/// ISL errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IslError {
    #[error("Unknown satellite id: {0}")]
    UnknownSatellite(u32),
    #[error("ISL from satellite {0} to itself")]
    SelfLoop(u32),
    #[error("Cannot handle more than {max} satellites (got {count})")]
    TooManySatellites { count: usize, max: usize },
    #[error("No satellite id known for destination {0}")]
    UnresolvedDestination(Mac48Address),
}

pub type Result<T> = std::result::Result<T, IslError>;

/// What the arbiter sees of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IslPacket {
    pub uid: u64,
    pub size_bytes: u32,
}

pub trait IslArbiter {
    /// Satellite this arbiter runs on
    fn sat_id(&self) -> u32;

    fn directory(&self) -> &dyn RoleDirectory;

    /// Local ISL interface index towards `target_sat_id`, or
    /// [`ROUTING_FAILURE`]
    fn decide(&self, source_sat_id: u32, target_sat_id: u32, packet: &IslPacket) -> i32;

    /// Resolve the destination MAC to a satellite id, then [`decide`](Self::decide)
    fn base_decide(&self, packet: &IslPacket, destination: &Mac48Address) -> Result<i32> {
        let target = self.directory().satellite_id(destination).ok_or_else(|| {
            warn!("sat {}: no satellite for {}", self.sat_id(), destination);
            IslError::UnresolvedDestination(*destination)
        })?;
        Ok(self.decide(self.sat_id(), target, packet))
    }
}

pub struct IslUnicastArbiter {
    sat_id: u32,
    next_hop: BTreeMap<u32, u32>,
    directory: SharedDirectory,
}

impl IslUnicastArbiter {
    pub fn new(sat_id: u32, directory: SharedDirectory) -> Self {
        Self {
            sat_id,
            next_hop: BTreeMap::new(),
            directory,
        }
    }

    pub fn with_table(sat_id: u32, table: BTreeMap<u32, u32>, directory: SharedDirectory) -> Self {
        Self {
            sat_id,
            next_hop: table,
            directory,
        }
    }

    /// Record the interface for a destination. The first entry added for a
    /// destination is kept.
    pub fn add_next_hop_entry(&mut self, destination_sat_id: u32, interface: u32) {
        self.next_hop.entry(destination_sat_id).or_insert(interface);
    }

    pub fn table(&self) -> &BTreeMap<u32, u32> {
        &self.next_hop
    }

    pub fn len(&self) -> usize {
        self.next_hop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_hop.is_empty()
    }
}

impl std::fmt::Debug for IslUnicastArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IslUnicastArbiter")
            .field("sat_id", &self.sat_id)
            .field("next_hop", &self.next_hop)
            .finish()
    }
}

impl IslArbiter for IslUnicastArbiter {
    fn sat_id(&self) -> u32 {
        self.sat_id
    }

    fn directory(&self) -> &dyn RoleDirectory {
        &*self.directory
    }

    fn decide(&self, source_sat_id: u32, target_sat_id: u32, packet: &IslPacket) -> i32 {
        match self.next_hop.get(&target_sat_id) {
            Some(&interface) => i32::try_from(interface).unwrap_or(ROUTING_FAILURE),
            None => {
                debug!(
                    "sat {}: no ISL towards {} (from {}, packet {})",
                    self.sat_id, target_sat_id, source_sat_id, packet.uid
                );
                ROUTING_FAILURE
            }
        }
    }
}
