//! Bounded key/value store layered under find-value/store (spec §3, §4.6).

use std::time::Instant;

use ahash::AHashMap;
use codec::identity::NodeId;

pub const CAPACITY: usize = 100;
pub const MAX_VALUE_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct DhtValue {
    pub bytes: Vec<u8>,
    /// Kept for `dht find` diagnostics only; eviction is reject-new, not
    /// age-based (spec §4.6 "Store").
    pub stored_at: Instant,
}

#[derive(Default)]
pub struct ValueStore {
    entries: AHashMap<NodeId, DhtValue>,
}

pub enum StoreOutcome {
    Stored,
    Overwritten,
    Rejected,
}

impl ValueStore {
    /// Insert or overwrite a value. Rejects new keys once [`CAPACITY`] is
    /// reached; overwrites of an existing key always succeed.
    pub fn store(&mut self, key: NodeId, value: Vec<u8>) -> StoreOutcome {
        if value.len() > MAX_VALUE_LEN {
            return StoreOutcome::Rejected;
        }

        let existed = self.entries.contains_key(&key);
        if !existed && self.entries.len() >= CAPACITY {
            return StoreOutcome::Rejected;
        }

        self.entries.insert(
            key,
            DhtValue {
                bytes: value,
                stored_at: Instant::now(),
            },
        );

        if existed {
            StoreOutcome::Overwritten
        } else {
            StoreOutcome::Stored
        }
    }

    pub fn find(&self, key: &NodeId) -> Option<&DhtValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips_and_overwrites() {
        let mut store = ValueStore::default();
        let key = NodeId::from_bytes([1u8; 20]);

        assert!(matches!(store.store(key, b"v1".to_vec()), StoreOutcome::Stored));
        assert_eq!(store.find(&key).unwrap().bytes, b"v1");

        assert!(matches!(store.store(key, b"v2".to_vec()), StoreOutcome::Overwritten));
        assert_eq!(store.find(&key).unwrap().bytes, b"v2");
    }

    #[test]
    fn capacity_bound_rejects_new_keys() {
        let mut store = ValueStore::default();
        for i in 0..CAPACITY {
            let mut bytes = [0u8; 20];
            bytes[0..8].copy_from_slice(&(i as u64).to_be_bytes());
            assert!(matches!(store.store(NodeId::from_bytes(bytes), vec![0]), StoreOutcome::Stored));
        }

        let overflow_key = NodeId::from_bytes([0xFFu8; 20]);
        assert!(matches!(store.store(overflow_key, vec![0]), StoreOutcome::Rejected));
    }
}
