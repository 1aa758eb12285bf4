//! Sequential IPv4 allocator
//!
//! One pool per address space (beam, UT users, GW users/backbone). Hosts
//! are handed out consecutively from the base inside the current network
//! block; `new_network` moves to the next block of the same size.

use crate::network::{DeviceId, Network};
use crate::{mask_to_prefix, NetStackError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::debug;

/// Network / mask / first-host triple for one address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPoolConfig {
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub base: Ipv4Addr,
}

impl AddressPoolConfig {
    pub fn new(network: Ipv4Addr, mask: Ipv4Addr, base: Ipv4Addr) -> Self {
        Self {
            network,
            mask,
            base,
        }
    }

    /// Satellite beam networks
    pub fn beam_default() -> Self {
        Self::new(
            Ipv4Addr::new(40, 1, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(0, 0, 0, 1),
        )
    }

    /// Subscriber LANs behind terminals
    pub fn ut_default() -> Self {
        Self::new(
            Ipv4Addr::new(10, 1, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(0, 0, 0, 1),
        )
    }

    /// Gateway backbone and GW-side user networks
    pub fn gw_default() -> Self {
        Self::new(
            Ipv4Addr::new(90, 1, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(0, 0, 0, 1),
        )
    }
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    network: u32,
    mask: u32,
    prefix: u8,
    base: u32,
    host: u32,
}

impl AddressPool {
    pub fn new(network: Ipv4Addr, mask: Ipv4Addr, base: Ipv4Addr) -> Result<Self> {
        let mut pool = Self {
            network: 0,
            mask: 0,
            prefix: 0,
            base: 0,
            host: 0,
        };
        pool.set_base(network, mask, base)?;
        Ok(pool)
    }

    pub fn from_config(config: &AddressPoolConfig) -> Result<Self> {
        Self::new(config.network, config.mask, config.base)
    }

    pub fn set_base(&mut self, network: Ipv4Addr, mask: Ipv4Addr, base: Ipv4Addr) -> Result<()> {
        let prefix = mask_to_prefix(mask)?;
        let mask = u32::from(mask);
        let network = u32::from(network);
        let base = u32::from(base);

        if prefix == 0 || prefix > 30 {
            return Err(NetStackError::InvalidNetwork(format!(
                "prefix /{} leaves no usable hosts",
                prefix
            )));
        }
        if network & !mask != 0 {
            return Err(NetStackError::InvalidNetwork(format!(
                "{} has host bits set for /{}",
                Ipv4Addr::from(network),
                prefix
            )));
        }
        if base == 0 || base & mask != 0 {
            return Err(NetStackError::InvalidNetwork(format!(
                "base {} is not a host part of /{}",
                Ipv4Addr::from(base),
                prefix
            )));
        }

        self.network = network;
        self.mask = mask;
        self.prefix = prefix;
        self.base = base;
        self.host = base;
        Ok(())
    }

    pub fn current_network(&self) -> Result<Ipv4Network> {
        Ipv4Network::new(Ipv4Addr::from(self.network), self.prefix)
            .map_err(|e| NetStackError::InvalidNetwork(e.to_string()))
    }

    /// Highest assignable host part (all-ones is broadcast)
    fn max_host(&self) -> u32 {
        !self.mask - 1
    }

    pub fn new_address(&mut self) -> Result<Ipv4Addr> {
        if self.host > self.max_host() {
            return Err(NetStackError::PoolExhausted(format!(
                "no hosts left in {}/{}",
                Ipv4Addr::from(self.network),
                self.prefix
            )));
        }
        let address = Ipv4Addr::from(self.network | self.host);
        self.host += 1;
        Ok(address)
    }

    /// Advance to the next network block and restart at the base host
    pub fn new_network(&mut self) -> Result<Ipv4Network> {
        let step = !self.mask + 1;
        self.network = self.network.checked_add(step).ok_or_else(|| {
            NetStackError::PoolExhausted(format!(
                "no networks left after {}/{}",
                Ipv4Addr::from(self.network),
                self.prefix
            ))
        })?;
        self.host = self.base;
        self.current_network()
    }

    /// Assign one address per device, in order, from the current network
    pub fn assign(&mut self, network: &mut Network, devices: &[DeviceId]) -> Result<Vec<Ipv4Addr>> {
        let mut assigned = Vec::with_capacity(devices.len());
        for device in devices {
            let address = self.new_address()?;
            network.assign_address(*device, address, self.prefix)?;
            assigned.push(address);
        }
        debug!(
            "assigned {} addresses from {}/{}",
            assigned.len(),
            Ipv4Addr::from(self.network),
            self.prefix
        );
        Ok(assigned)
    }
}
