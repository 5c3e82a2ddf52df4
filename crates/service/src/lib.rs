//! Overlay service layer: the peer table (C6), the Kademlia DHT (C7), and
//! the rendezvous directory (C8) that rides on top of it. Socket I/O, STUN/
//! TURN, ICE, discovery, and the dispatch loop live in the `overlay-node`
//! binary crate, which depends on this one the way `turn-server` depends on
//! `turn-server-service`.

pub mod dht;
pub mod peer_table;
pub mod rendezvous;

pub use dht::DhtEngine;
pub use peer_table::{PeerId, PeerRecord, PeerTable, PeerTableOptions};
pub use rendezvous::{Membership, RendezvousValue};
