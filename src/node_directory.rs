//! The set of known nodes (candidate peers).
//!
//! Pure data structure: the gateway wraps it in its state lock. The owner's
//! own address is passed in on every insert so the directory can never hold
//! it, even across an address change.

use crate::network::address::NetAddress;
use rand::seq::IteratorRandom;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct NodeEntry {
    /// Consecutive failed liveness probes
    probe_failures: u32,
}

#[derive(Debug, Default, Clone)]
pub struct NodeDirectory {
    nodes: HashMap<NetAddress, NodeEntry>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `addr` unless it is already present or is `own`. Returns
    /// whether the directory changed.
    pub fn add(&mut self, addr: NetAddress, own: &NetAddress) -> bool {
        if &addr == own || self.nodes.contains_key(&addr) {
            return false;
        }
        self.nodes.insert(
            addr,
            NodeEntry { probe_failures: 0 },
        );
        true
    }

    pub fn remove(&mut self, addr: &NetAddress) -> bool {
        self.nodes.remove(addr).is_some()
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.nodes.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn addresses(&self) -> Vec<NetAddress> {
        self.nodes.keys().cloned().collect()
    }

    /// Up to `cap` random addresses, skipping any for which `skip` is true.
    pub fn sample<F>(&self, cap: usize, skip: F) -> Vec<NetAddress>
    where
        F: Fn(&NetAddress) -> bool,
    {
        self.nodes
            .keys()
            .filter(|addr| !skip(addr))
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), cap)
    }

    /// Record a failed probe; returns the new consecutive failure count, or
    /// None if the node is no longer in the directory.
    pub fn record_probe_failure(&mut self, addr: &NetAddress) -> Option<u32> {
        self.nodes.get_mut(addr).map(|entry| {
            entry.probe_failures = entry.probe_failures.saturating_add(1);
            entry.probe_failures
        })
    }

    pub fn record_probe_success(&mut self, addr: &NetAddress) {
        if let Some(entry) = self.nodes.get_mut(addr) {
            entry.probe_failures = 0;
        }
    }
}
