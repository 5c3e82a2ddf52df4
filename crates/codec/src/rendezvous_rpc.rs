//! Rendezvous RPC body carried inside a peer datagram's `data` field when
//! its `MessageType` is one of the `Rendezvous*` variants (spec §4.7,
//! §6). Grounded on `rendezvous.h`'s `RendezvousMessage`; kept as a
//! colon-separated text record like [`crate::discovery::MulticastFrame`]
//! rather than the original's fixed `char[]` struct, since these are
//! low-frequency control messages, not a hot path.

use crate::identity::NodeId;
use crate::Error;

/// Rendezvous keys are capped at 63 characters (spec §3), mirrored from
/// `overlay_service::rendezvous::MAX_KEY_LEN`.
pub const MAX_KEY_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousMessage {
    pub node_id: NodeId,
    pub key: String,
    pub ip: String,
    pub port: u16,
    pub public_ip: String,
    pub public_port: u16,
    pub is_public: bool,
    pub timestamp: u32,
}

impl RendezvousMessage {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            self.node_id.to_hex(),
            self.key,
            self.ip,
            self.port,
            self.public_ip,
            self.public_port,
            if self.is_public { 1 } else { 0 },
            self.timestamp,
        )
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        if fields.len() != 8 {
            return Err(Error::InvalidInput);
        }

        let key = fields[1].to_string();
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            node_id: NodeId::from_hex(fields[0])?,
            key,
            ip: fields[2].to_string(),
            port: fields[3].parse().map_err(|_| Error::InvalidInput)?,
            public_ip: fields[4].to_string(),
            public_port: fields[5].parse().map_err(|_| Error::InvalidInput)?,
            is_public: fields[6] == "1",
            timestamp: fields[7].parse().map_err(|_| Error::InvalidInput)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let message = RendezvousMessage {
            node_id: NodeId::random(),
            key: "/room/42".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 8000,
            public_ip: "0.0.0.0".to_string(),
            public_port: 0,
            is_public: false,
            timestamp: 1_700_000_000,
        };

        assert_eq!(RendezvousMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn rejects_oversized_key() {
        let message = RendezvousMessage {
            node_id: NodeId::random(),
            key: "x".repeat(MAX_KEY_LEN + 1),
            ip: "127.0.0.1".to_string(),
            port: 8000,
            public_ip: "0.0.0.0".to_string(),
            public_port: 0,
            is_public: false,
            timestamp: 0,
        };

        assert!(RendezvousMessage::decode(&message.encode()).is_err());
    }
}
