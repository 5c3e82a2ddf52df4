//! Rendezvous directory (spec §4.7, C8): a string key -> DHT id mapping
//! used purely for peer discovery, layered on [`crate::dht::DhtEngine`].
//! The network side (sending RENDEZVOUS_QUERY/RESPONSE/CONNECT and
//! importing replies into the peer table) lives in the dispatcher; this
//! module owns the membership bookkeeping and the wire value format.

use std::net::SocketAddrV4;
use std::time::Instant;

use ahash::AHashMap;
use codec::identity::NodeId;
use parking_lot::Mutex;

/// Rendezvous keys are capped at 63 characters (spec §3).
pub const MAX_KEY_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct MembershipEntry {
    pub last_used: Instant,
    pub active: bool,
}

#[derive(Default)]
pub struct Membership {
    keys: Mutex<AHashMap<String, MembershipEntry>>,
}

pub enum JoinError {
    KeyTooLong,
}

impl Membership {
    /// Join `key`: record it as locally-active membership. The caller
    /// still has to store [`RendezvousValue::encode`] under
    /// `NodeId::from_str(key)` via the DHT.
    pub fn join(&self, key: &str) -> Result<NodeId, JoinError> {
        if key.len() > MAX_KEY_LEN {
            return Err(JoinError::KeyTooLong);
        }

        self.keys.lock().insert(
            key.to_string(),
            MembershipEntry {
                last_used: Instant::now(),
                active: true,
            },
        );

        Ok(NodeId::from_str(key))
    }

    /// Leave `key`: mark the local membership inactive. A full
    /// implementation additionally issues a DHT delete tombstone under
    /// the key's id (spec §4.7 OPEN item, resolved in DESIGN.md) — that
    /// network step is the caller's responsibility since it requires
    /// access to the DHT/dispatcher.
    pub fn leave(&self, key: &str) -> bool {
        if let Some(entry) = self.keys.lock().get_mut(key) {
            entry.active = false;
            true
        } else {
            false
        }
    }

    pub fn is_member(&self, key: &str) -> bool {
        self.keys.lock().get(key).map(|e| e.active).unwrap_or(false)
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.keys
            .lock()
            .iter()
            .filter(|(_, e)| e.active)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.keys.lock().get_mut(key) {
            entry.last_used = Instant::now();
        }
    }
}

/// The value stored under a rendezvous key's DHT id: the publisher's
/// endpoint tuple (spec §4.7 "join").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousValue {
    pub node_id: NodeId,
    pub ip: std::net::Ipv4Addr,
    pub port: u16,
    pub public_ip: Option<std::net::Ipv4Addr>,
    pub public_port: Option<u16>,
    pub behind_nat: bool,
}

impl RendezvousValue {
    pub fn local_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    pub fn public_endpoint(&self) -> Option<SocketAddrV4> {
        match (self.public_ip, self.public_port) {
            (Some(ip), Some(port)) => Some(SocketAddrV4::new(ip, port)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.node_id.to_hex(),
            self.ip,
            self.port,
            self.public_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string()),
            self.public_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            if self.behind_nat { 1 } else { 0 },
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let fields: Vec<&str> = text.split(':').collect();
        if fields.len() != 6 {
            return None;
        }

        let node_id = NodeId::from_hex(fields[0]).ok()?;
        let ip = fields[1].parse().ok()?;
        let port = fields[2].parse().ok()?;
        let public_ip = if fields[3] == "-" { None } else { fields[3].parse().ok() };
        let public_port = if fields[4] == "-" { None } else { fields[4].parse().ok() };
        let behind_nat = fields[5] == "1";

        Some(Self {
            node_id,
            ip,
            port,
            public_ip,
            public_port,
            behind_nat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn join_then_leave_tracks_active_flag() {
        let membership = Membership::default();
        membership.join("/room/42").unwrap();
        assert!(membership.is_member("/room/42"));

        membership.leave("/room/42");
        assert!(!membership.is_member("/room/42"));
    }

    #[test]
    fn key_too_long_is_rejected() {
        let membership = Membership::default();
        let key = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(membership.join(&key), Err(JoinError::KeyTooLong)));
    }

    #[test]
    fn rendezvous_value_round_trips() {
        let value = RendezvousValue {
            node_id: NodeId::from_bytes([9u8; 20]),
            ip: Ipv4Addr::new(127, 0, 0, 1),
            port: 8000,
            public_ip: Some(Ipv4Addr::new(203, 0, 113, 5)),
            public_port: Some(40000),
            behind_nat: true,
        };

        let encoded = value.encode();
        assert_eq!(RendezvousValue::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn same_key_hashes_to_same_id() {
        let a = NodeId::from_str("/room/42");
        let b = NodeId::from_str("/room/42");
        assert_eq!(a, b);
    }
}
