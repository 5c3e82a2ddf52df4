//! The peer table (spec §4.5, C6): known peers, last-seen, reachability.
//!
//! Shared by the dispatcher, discovery, DHT, rendezvous, and NAT-traversal
//! drivers. All mutation is serialized through a single `parking_lot::Mutex`
//! (lock order: peer-table -> DHT -> rendezvous -> ICE -> TURN, per spec
//! §5); lookups clone the fields callers need before releasing the lock.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use codec::identity::NodeId;
use parking_lot::Mutex;

/// Peer record stale timeout: no contact for this long and `reap` removes
/// the record (spec §3 "Lifecycles").
pub const STALE_TIMEOUT: Duration = Duration::from_secs(300);

pub type PeerId = i32;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub node_id: Option<NodeId>,
    pub local_endpoint: SocketAddrV4,
    pub public_endpoint: Option<SocketAddrV4>,
    pub is_public: bool,
    pub last_seen: Instant,
    pub reachable: bool,
}

pub struct PeerTableOptions {
    pub max_nodes: usize,
}

impl Default for PeerTableOptions {
    fn default() -> Self {
        Self { max_nodes: 256 }
    }
}

pub struct PeerTable {
    max_nodes: usize,
    inner: Mutex<AHashMap<PeerId, PeerRecord>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(PeerTableOptions::default())
    }
}

impl PeerTable {
    pub fn new(options: PeerTableOptions) -> Self {
        Self {
            max_nodes: options.max_nodes,
            inner: Mutex::new(AHashMap::new()),
        }
    }

    /// Insert a new record, or refresh an existing one's endpoints and
    /// `last_seen`. Fails (returns `false`) when the table is full and
    /// `peer_id` is not already present.
    pub fn add_or_update(
        &self,
        peer_id: PeerId,
        node_id: Option<NodeId>,
        local_endpoint: SocketAddrV4,
        public_endpoint: Option<SocketAddrV4>,
    ) -> bool {
        let mut table = self.inner.lock();

        if let Some(record) = table.get_mut(&peer_id) {
            record.local_endpoint = local_endpoint;
            if public_endpoint.is_some() {
                record.public_endpoint = public_endpoint;
            }
            if node_id.is_some() {
                record.node_id = node_id;
            }
            record.last_seen = Instant::now();
            return true;
        }

        if table.len() >= self.max_nodes {
            return false;
        }

        table.insert(
            peer_id,
            PeerRecord {
                peer_id,
                node_id,
                local_endpoint,
                public_endpoint,
                is_public: false,
                last_seen: Instant::now(),
                reachable: true,
            },
        );

        true
    }

    pub fn remove(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.inner.lock().remove(&peer_id)
    }

    /// Refresh `last_seen` on confirmed receipt from `peer_id`. No-op if
    /// the peer is unknown.
    pub fn touch(&self, peer_id: PeerId) {
        if let Some(record) = self.inner.lock().get_mut(&peer_id) {
            record.last_seen = Instant::now();
        }
    }

    pub fn lookup(&self, peer_id: PeerId) -> Option<PeerRecord> {
        self.inner.lock().get(&peer_id).cloned()
    }

    pub fn set_reachable(&self, peer_id: PeerId, reachable: bool) {
        if let Some(record) = self.inner.lock().get_mut(&peer_id) {
            record.reachable = reachable;
        }
    }

    pub fn set_public(&self, peer_id: PeerId, is_public: bool) {
        if let Some(record) = self.inner.lock().get_mut(&peer_id) {
            record.is_public = is_public;
        }
    }

    /// Remove every record whose `last_seen` is older than [`STALE_TIMEOUT`].
    /// Returns the removed peer ids.
    pub fn reap(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut table = self.inner.lock();
        let stale: Vec<PeerId> = table
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > STALE_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            table.remove(id);
        }

        stale
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<PeerRecord> {
        self.inner.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn add_update_touch_lookup() {
        let table = PeerTable::default();
        assert!(table.add_or_update(1, None, addr(8000), None));
        assert!(table.add_or_update(1, None, addr(8001), None));

        let record = table.lookup(1).unwrap();
        assert_eq!(record.local_endpoint, addr(8001));
    }

    #[test]
    fn full_table_rejects_new_peers_but_updates_existing() {
        let table = PeerTable::new(PeerTableOptions { max_nodes: 1 });
        assert!(table.add_or_update(1, None, addr(8000), None));
        assert!(!table.add_or_update(2, None, addr(8001), None));
        assert!(table.add_or_update(1, None, addr(8002), None));
    }

    #[test]
    fn reap_removes_only_stale_peers() {
        let table = PeerTable::default();
        table.add_or_update(1, None, addr(8000), None);

        {
            let mut inner = table.inner.lock();
            let record = inner.get_mut(&1).unwrap();
            record.last_seen = Instant::now() - STALE_TIMEOUT - Duration::from_secs(1);
        }

        table.add_or_update(2, None, addr(8001), None);

        let reaped = table.reap();
        assert_eq!(reaped, vec![1]);
        assert!(table.lookup(1).is_none());
        assert!(table.lookup(2).is_some());
    }
}
