//! Dispatcher constants and small pure helpers (spec §4.10, C11). The
//! receive loop, maintenance tick, and hole-punch driver that use these
//! live on [`crate::node::Node`] — this module holds the timing budget
//! and the peer-list import/export logic, kept separate because both the
//! dispatcher and the REPL's `list`/`nodes` commands need them.

use std::time::Duration;

use codec::peer::{decode_peer_list, encode_peer_list, PeerListEntry};
use service::peer_table::PeerId;

/// Maintenance tick rate (spec §5 "1 Hz").
pub const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// PING cadence (spec §4.10).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A peer silent for at least this long, but less than the reap timeout,
/// is probed (spec §4.10 "reconnect").
pub const RECONNECT_THRESHOLD: Duration = Duration::from_secs(KEEPALIVE_INTERVAL.as_secs() * 2);

/// A peer silent for at least this long is reaped (spec §3, §4.10).
pub const REAP_TIMEOUT: Duration = Duration::from_secs(300);

/// Direct hole-punch burst: 5 datagrams at 100ms intervals (spec §4.10).
pub const HOLE_PUNCH_ATTEMPTS: usize = 5;
pub const HOLE_PUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// Firewall-bypass sweep cadence when probing [`crate::net::udp::FALLBACK_PORTS`]
/// (spec §4.10).
pub const FIREWALL_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Builds the `count,id:ip:port:pub_ip:pub_port:is_public,...` PEER_LIST
/// payload for every peer except `exclude` (spec §4.10 "Peer list
/// exchange").
pub fn build_peer_list(entries: &[PeerListEntry], exclude: PeerId) -> String {
    let filtered: Vec<PeerListEntry> = entries.iter().filter(|e| e.id != exclude).cloned().collect();
    encode_peer_list(&filtered)
}

pub fn parse_peer_list(payload: &str) -> Result<Vec<PeerListEntry>, codec::Error> {
    decode_peer_list(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_list_excludes_the_recipient() {
        let entries = vec![
            PeerListEntry {
                id: 1,
                ip: "10.0.0.1".into(),
                port: 8000,
                public_ip: "0.0.0.0".into(),
                public_port: 0,
                is_public: false,
            },
            PeerListEntry {
                id: 2,
                ip: "10.0.0.2".into(),
                port: 8001,
                public_ip: "0.0.0.0".into(),
                public_port: 0,
                is_public: false,
            },
        ];

        let payload = build_peer_list(&entries, 2);
        let parsed = parse_peer_list(&payload).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, 1);
    }
}
