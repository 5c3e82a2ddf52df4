//! 160 k-buckets indexed by common-prefix length with the local id (spec
//! §3 "Routing table", §4.6).

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use codec::identity::NodeId;

use super::bucket::{AddOutcome, BucketEntry, KBucket, K};

/// How often a bucket is refreshed with a random-id find-node lookup.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: (0..160).map(|_| KBucket::default()).collect(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Add or refresh a node (spec §4.6 "Add node"). Returns `true` if the
    /// node now occupies a slot in the table.
    pub fn add_node(&mut self, node_id: NodeId, endpoint: SocketAddrV4) -> bool {
        if node_id == self.local_id {
            return false;
        }

        let bucket_idx = self.local_id.distance(&node_id);
        if bucket_idx as usize >= self.buckets.len() {
            return false;
        }

        let bucket = &mut self.buckets[bucket_idx as usize];
        match bucket.add(node_id, endpoint, Instant::now()) {
            AddOutcome::Refreshed | AddOutcome::Inserted | AddOutcome::Evicted => true,
            AddOutcome::Rejected => false,
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) {
        let idx = self.local_id.distance(node_id);
        if (idx as usize) < self.buckets.len() {
            self.buckets[idx as usize].remove(node_id);
        }
    }

    /// Closest `n` known contacts to `target`, sorted by XOR distance,
    /// smallest first, with no duplicates (spec §4.6 "Find-node", §8).
    pub fn find_node(&self, target: &NodeId, n: usize) -> Vec<BucketEntry> {
        let mut all: Vec<BucketEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect();

        all.sort_by_key(|entry| entry.node_id.xor(target));
        all.truncate(n);
        all
    }

    /// Buckets whose `last_updated` predates [`REFRESH_INTERVAL`] and are
    /// non-empty: each needs a find-node on a random id inside its range.
    pub fn buckets_needing_refresh(&self, now: Instant) -> Vec<(u32, NodeId)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && now.duration_since(b.last_updated) > REFRESH_INTERVAL)
            .map(|(idx, _)| (idx as u32, self.local_id.flip_bit(idx as u32)))
            .collect()
    }

    pub fn mark_refreshed(&mut self, bucket_idx: u32) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx as usize) {
            bucket.last_updated = Instant::now();
        }
    }

    /// Remove entries unseen for more than `2 * REFRESH_INTERVAL` (spec
    /// §4.6 "Refresh").
    pub fn evict_stale(&mut self, now: Instant) -> Vec<NodeId> {
        let max_age = REFRESH_INTERVAL * 2;
        self.buckets
            .iter_mut()
            .flat_map(|b| b.evict_older_than(now, max_age))
            .collect()
    }

    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets[idx].len()
    }

    pub fn total_len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

pub const ALPHA: usize = 3;
pub use super::bucket::K as BUCKET_K;
const _: () = assert!(K == 8);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn bucket_placement_is_exclusive() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);

        let mut id_bytes = [0u8; 20];
        id_bytes[0] = 0b0000_1000;
        let id = NodeId::from_bytes(id_bytes);

        assert!(table.add_node(id, ep(9000)));

        let expected_bucket = local.distance(&id) as usize;
        assert_eq!(table.bucket_len(expected_bucket), 1);

        for (idx, len) in (0..160).map(|i| (i, table.bucket_len(i))) {
            if idx != expected_bucket {
                assert_eq!(len, 0);
            }
        }
    }

    #[test]
    fn find_node_orders_by_xor_distance() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);

        let ids: Vec<NodeId> = [0x01u8, 0x02, 0x04, 0x08]
            .iter()
            .map(|&b| {
                let mut bytes = [0u8; 20];
                bytes[0] = b;
                NodeId::from_bytes(bytes)
            })
            .collect();

        for (i, id) in ids.iter().enumerate() {
            table.add_node(*id, ep(9000 + i as u16));
        }

        let found = table.find_node(&local, 3);
        let found_ids: Vec<NodeId> = found.iter().map(|e| e.node_id).collect();
        assert_eq!(found_ids, vec![ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn local_id_never_inserted() {
        let local = NodeId::from_bytes([0xAAu8; 20]);
        let mut table = RoutingTable::new(local);
        assert!(!table.add_node(local, ep(8000)));
        assert_eq!(table.total_len(), 0);
    }
}
