//! External diagnostics collaborator (spec §9 "opaque observer pointer").
//!
//! The original keeps a process-global observer pointer that callbacks
//! fire into for UI/metrics integration. That pointer is a seam the spec
//! leaves to the embedder; `Observer` is the typed trait standing in for
//! it, with [`LoggingObserver`] as the default implementation that simply
//! logs through the `log` facade the way `turn-server` reports session
//! events.

use std::net::SocketAddrV4;

use codec::identity::NodeId;

/// Notified of node lifecycle events. Implementations are expected to be
/// cheap and non-blocking; the dispatcher calls these inline on its
/// receive loop.
pub trait Observer: Send + Sync {
    fn peer_discovered(&self, node_id: NodeId, endpoint: SocketAddrV4) {
        let _ = (node_id, endpoint);
    }

    fn peer_lost(&self, node_id: NodeId) {
        let _ = node_id;
    }

    fn nat_traversal_succeeded(&self, node_id: NodeId, endpoint: SocketAddrV4) {
        let _ = (node_id, endpoint);
    }

    fn nat_traversal_failed(&self, node_id: NodeId) {
        let _ = node_id;
    }

    fn message_received(&self, from: NodeId, bytes: usize) {
        let _ = (from, bytes);
    }
}

/// Default observer: routes every event to the `log` facade at `debug`
/// or `info` depending on how noteworthy the event is.
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn peer_discovered(&self, node_id: NodeId, endpoint: SocketAddrV4) {
        log::info!("peer discovered: {} at {}", node_id.to_hex(), endpoint);
    }

    fn peer_lost(&self, node_id: NodeId) {
        log::info!("peer lost: {}", node_id.to_hex());
    }

    fn nat_traversal_succeeded(&self, node_id: NodeId, endpoint: SocketAddrV4) {
        log::info!("hole punch succeeded with {} via {}", node_id.to_hex(), endpoint);
    }

    fn nat_traversal_failed(&self, node_id: NodeId) {
        log::warn!("hole punch failed with {}", node_id.to_hex());
    }

    fn message_received(&self, from: NodeId, bytes: usize) {
        log::debug!("{} bytes received from {}", bytes, from.to_hex());
    }
}
