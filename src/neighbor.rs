//! The neighbor (ARP) table (C3): a plain `IPv4 -> (MAC, device)` map behind
//! a reader-writer lock. Grounded on `arptable.rs` in the teacher tree, but
//! widened to also remember which device an entry was learned on (needed so
//! the TX path can pick the right device's FIFO) and to support the
//! replace-on-conflict policy flag the spec calls for.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use pnet::util::MacAddr;

use crate::device::Device;

#[derive(Clone)]
pub struct NeighborEntry {
    pub mac: MacAddr,
    pub device: Arc<Device>,
}

#[derive(Default)]
pub struct NeighborTable {
    entries: RwLock<HashMap<Ipv4Addr, NeighborEntry>>,
}

impl NeighborTable {
    pub fn new() -> Self {
        NeighborTable::default()
    }

    /// Inserts or updates `ip -> entry`. A no-op if `ip` is already present
    /// and `replace` is `false` — gratuitous learning from observed traffic
    /// should not clobber a manually pinned entry, but an explicit refresh
    /// should.
    pub fn insert(&self, ip: Ipv4Addr, entry: NeighborEntry, replace: bool) {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&ip) && !replace {
            return;
        }
        entries.insert(ip, entry);
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<NeighborEntry> {
        self.entries.read().unwrap().get(&ip).cloned()
    }
}
