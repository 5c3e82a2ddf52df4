//! Kademlia DHT (spec §4.6, C7): k-buckets, iterative find-node/find-value,
//! bounded value storage, periodic refresh. The iterative lookup itself is
//! driven by the dispatcher (to allow pipelining/cancellation, per spec);
//! this module provides the primitives it calls.

pub mod bucket;
pub mod routing_table;
pub mod value_store;

use std::net::SocketAddrV4;
use std::time::Instant;

use codec::identity::NodeId;
use parking_lot::Mutex;

pub use bucket::{BucketEntry, K};
pub use routing_table::{RoutingTable, ALPHA, REFRESH_INTERVAL};
pub use value_store::{DhtValue, StoreOutcome, ValueStore, CAPACITY as VALUE_STORE_CAPACITY};

pub struct DhtEngine {
    routing_table: Mutex<RoutingTable>,
    values: Mutex<ValueStore>,
}

impl DhtEngine {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            routing_table: Mutex::new(RoutingTable::new(local_id)),
            values: Mutex::new(ValueStore::default()),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.routing_table.lock().local_id()
    }

    pub fn add_node(&self, node_id: NodeId, endpoint: SocketAddrV4) -> bool {
        self.routing_table.lock().add_node(node_id, endpoint)
    }

    pub fn remove_node(&self, node_id: &NodeId) {
        self.routing_table.lock().remove(node_id);
    }

    pub fn find_node(&self, target: &NodeId, n: usize) -> Vec<BucketEntry> {
        self.routing_table.lock().find_node(target, n)
    }

    /// Local-store lookup first; on miss, the `ALPHA` closest known nodes
    /// for the caller to query next (spec §4.6 "Find-value").
    pub fn find_value(&self, key: &NodeId) -> FindValueResult {
        if let Some(value) = self.values.lock().find(key) {
            return FindValueResult::Found(value.bytes.clone());
        }

        FindValueResult::Closest(self.find_node(key, ALPHA))
    }

    pub fn store(&self, key: NodeId, value: Vec<u8>) -> StoreOutcome {
        self.values.lock().store(key, value)
    }

    pub fn buckets_needing_refresh(&self, now: Instant) -> Vec<(u32, NodeId)> {
        self.routing_table.lock().buckets_needing_refresh(now)
    }

    pub fn mark_refreshed(&self, bucket_idx: u32) {
        self.routing_table.lock().mark_refreshed(bucket_idx);
    }

    pub fn evict_stale(&self, now: Instant) -> Vec<NodeId> {
        self.routing_table.lock().evict_stale(now)
    }

    pub fn total_len(&self) -> usize {
        self.routing_table.lock().total_len()
    }
}

pub enum FindValueResult {
    Found(Vec<u8>),
    Closest(Vec<BucketEntry>),
}

/// Drives one round of the standard Kademlia iterative lookup (spec
/// §4.6): maintain a shortlist of the `K` closest known nodes, query
/// `ALPHA` of the not-yet-queried closest in parallel, merge results,
/// terminate when the `K` closest have all been queried or no closer
/// node was returned. The network I/O (sending DHT_FIND_NODE and waiting
/// for replies) is the dispatcher's job; this type only tracks state.
pub struct IterativeLookup {
    target: NodeId,
    shortlist: Vec<BucketEntry>,
    queried: std::collections::HashSet<NodeId>,
}

impl IterativeLookup {
    pub fn new(target: NodeId, seed: Vec<BucketEntry>) -> Self {
        let mut lookup = Self {
            target,
            shortlist: Vec::new(),
            queried: std::collections::HashSet::new(),
        };
        lookup.merge(seed);
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Merge newly-learned contacts into the shortlist, keeping only the
    /// `K` closest and re-sorting by distance to the target.
    pub fn merge(&mut self, contacts: Vec<BucketEntry>) {
        for contact in contacts {
            if !self.shortlist.iter().any(|e| e.node_id == contact.node_id) {
                self.shortlist.push(contact);
            }
        }

        self.shortlist.sort_by_key(|e| e.node_id.xor(&self.target));
        self.shortlist.truncate(K);
    }

    /// Up to `ALPHA` not-yet-queried contacts from the shortlist, marked
    /// queried as they're returned.
    pub fn next_batch(&mut self) -> Vec<BucketEntry> {
        let batch: Vec<BucketEntry> = self
            .shortlist
            .iter()
            .filter(|e| !self.queried.contains(&e.node_id))
            .take(ALPHA)
            .cloned()
            .collect();

        for entry in &batch {
            self.queried.insert(entry.node_id);
        }

        batch
    }

    /// The lookup is finished once every shortlist member has been
    /// queried.
    pub fn is_done(&self) -> bool {
        self.shortlist.iter().all(|e| self.queried.contains(&e.node_id))
    }

    pub fn shortlist(&self) -> &[BucketEntry] {
        &self.shortlist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn find_value_falls_back_to_closest_nodes_on_miss() {
        let local = NodeId::from_bytes([0u8; 20]);
        let dht = DhtEngine::new(local);

        let mut id_bytes = [0u8; 20];
        id_bytes[0] = 1;
        let id = NodeId::from_bytes(id_bytes);
        dht.add_node(id, ep(9000));

        match dht.find_value(&NodeId::from_bytes([2u8; 20])) {
            FindValueResult::Closest(nodes) => assert!(!nodes.is_empty()),
            FindValueResult::Found(_) => panic!("expected a miss"),
        }
    }

    #[test]
    fn iterative_lookup_terminates() {
        let target = NodeId::from_bytes([0u8; 20]);
        let seed = vec![BucketEntry {
            node_id: NodeId::from_bytes([1u8; 20]),
            endpoint: ep(9000),
            last_seen: Instant::now(),
        }];

        let mut lookup = IterativeLookup::new(target, seed);
        assert!(!lookup.is_done());

        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        assert!(lookup.is_done());
    }
}
