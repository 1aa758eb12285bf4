//! Neighbor cache for satellite-facing interfaces
//!
//! Satellite hops never run ARP Request/Reply, so every entry installed
//! by the provisioning and handover code is permanent. A reverse index
//! (MAC -> addresses) backs the "remove everything pointing at this
//! terminal" operation used on handover.

use crate::Mac48Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub mac: Mac48Address,
    /// Never expires, never resolved dynamically
    pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ArpCache {
    entries: BTreeMap<Ipv4Addr, ArpEntry>,
    by_mac: HashMap<Mac48Address, BTreeSet<Ipv4Addr>>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, address: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.get(&address)
    }

    /// Add or refresh a permanent entry. Returns `false` when an identical
    /// permanent entry was already present.
    pub fn add_permanent(&mut self, address: Ipv4Addr, mac: Mac48Address) -> bool {
        let entry = ArpEntry {
            mac,
            permanent: true,
        };
        match self.entries.insert(address, entry) {
            Some(previous) if previous == entry => false,
            Some(previous) => {
                self.unindex(previous.mac, address);
                self.by_mac.entry(mac).or_default().insert(address);
                true
            }
            None => {
                self.by_mac.entry(mac).or_default().insert(address);
                true
            }
        }
    }

    /// Addresses currently resolved to `mac`, in ascending order
    pub fn lookup_inverse(&self, mac: &Mac48Address) -> Vec<Ipv4Addr> {
        self.by_mac
            .get(mac)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, address: Ipv4Addr) -> Option<ArpEntry> {
        let entry = self.entries.remove(&address)?;
        self.unindex(entry.mac, address);
        Some(entry)
    }

    /// Drop every entry resolving to `mac`
    pub fn remove_by_mac(&mut self, mac: &Mac48Address) -> Vec<Ipv4Addr> {
        let addresses: Vec<Ipv4Addr> = self
            .by_mac
            .remove(mac)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for address in &addresses {
            self.entries.remove(address);
        }
        addresses
    }

    /// Copy every permanent entry of `other` into this cache
    pub fn merge_permanent(&mut self, other: &ArpCache) {
        for (address, entry) in other.iter() {
            if entry.permanent {
                self.add_permanent(address, entry.mac);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ipv4Addr, &ArpEntry)> {
        self.entries.iter().map(|(ip, e)| (*ip, e))
    }

    fn unindex(&mut self, mac: Mac48Address, address: Ipv4Addr) {
        if let Some(set) = self.by_mac.get_mut(&mac) {
            set.remove(&address);
            if set.is_empty() {
                self.by_mac.remove(&mac);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mac(i: u64) -> Mac48Address {
        Mac48Address::from_index(i)
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Addr::new(40, 1, 0, 1);
        assert!(cache.add_permanent(ip, mac(1)));
        assert!(!cache.add_permanent(ip, mac(1)));
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(ip).unwrap().permanent);
    }

    #[test]
    fn test_refresh_reindexes_mac() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Addr::new(40, 1, 0, 1);
        cache.add_permanent(ip, mac(1));
        assert!(cache.add_permanent(ip, mac(2)));

        assert!(cache.lookup_inverse(&mac(1)).is_empty());
        assert_eq!(cache.lookup_inverse(&mac(2)), vec![ip]);
        assert_eq!(cache.lookup(ip).unwrap().mac, mac(2));
    }

    #[test]
    fn test_remove_by_mac_removes_all_matches() {
        let mut cache = ArpCache::new();
        cache.add_permanent(Ipv4Addr::new(40, 1, 0, 2), mac(7));
        cache.add_permanent(Ipv4Addr::new(10, 1, 0, 1), mac(7));
        cache.add_permanent(Ipv4Addr::new(40, 1, 0, 3), mac(8));

        let removed = cache.remove_by_mac(&mac(7));
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup_inverse(&mac(7)).is_empty());
        assert!(cache.remove_by_mac(&mac(7)).is_empty());
    }

    #[test]
    fn test_merge_copies_permanent_entries() {
        let mut template = ArpCache::new();
        template.add_permanent(Ipv4Addr::new(40, 1, 0, 1), mac(1));

        let mut cache = ArpCache::new();
        cache.add_permanent(Ipv4Addr::new(40, 1, 0, 9), mac(9));
        cache.merge_permanent(&template);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup_inverse(&mac(1)), vec![Ipv4Addr::new(40, 1, 0, 1)]);
    }

    proptest! {
        #[test]
        fn reverse_index_matches_forward_entries(
            ops in proptest::collection::vec((0u8..16, 0u64..4, any::<bool>()), 0..64)
        ) {
            let mut cache = ArpCache::new();
            for (host, m, insert) in ops {
                let ip = Ipv4Addr::new(40, 1, 0, host);
                if insert {
                    cache.add_permanent(ip, mac(m));
                } else {
                    cache.remove(ip);
                }
            }
            for m in 0u64..4 {
                let expected: Vec<Ipv4Addr> = cache
                    .iter()
                    .filter(|(_, e)| e.mac == mac(m))
                    .map(|(ip, _)| ip)
                    .collect();
                prop_assert_eq!(cache.lookup_inverse(&mac(m)), expected);
            }
        }
    }
}
