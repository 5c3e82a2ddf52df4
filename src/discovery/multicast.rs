//! LAN multicast discovery (spec §4.9 "LAN multicast", C10): joins
//! `239.255.255.251:8889` with TTL 32, announces every 5s, queries every
//! 15s, and feeds newly-seen peers back to the caller. Grounded in
//! `discovery.c`/`enhanced_discovery.c`'s `IP_ADD_MEMBERSHIP`+`SO_BROADCAST`
//! socket setup (spec §4.2), carried over here on a `tokio::net::UdpSocket`
//! built from a `socket2::Socket` the way [`crate::net::UdpEndpoint`] binds
//! its own socket.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use codec::discovery::{MulticastFrame, MulticastKind};
use tokio::net::UdpSocket;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 251);
pub const MULTICAST_PORT: u16 = 8889;
pub const MULTICAST_TTL: u32 = 32;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
pub const QUERY_INTERVAL: Duration = Duration::from_secs(15);

/// A received announce/query/response, already past loop-suppression
/// (spec §4.9: "own" announcements and already-seen sequence numbers are
/// dropped before the caller ever sees them).
#[derive(Debug, Clone)]
pub struct MulticastEvent {
    pub frame: MulticastFrame,
    pub from: SocketAddr,
}

/// Joins the LAN multicast group on every address the OS routes
/// multicast traffic through by default (`INADDR_ANY`, matching
/// `discovery.c`'s `mreq.imr_interface = INADDR_ANY` — per-interface
/// enumeration would need a platform interface-listing crate outside the
/// teacher's dependency stack, so this binds the one "default route"
/// membership the original's socket setup actually performs).
pub struct MulticastDiscovery {
    socket: UdpSocket,
    local_node_id: i32,
    sequence: AtomicU32,
    /// Bounded window of recently-seen `(node_id, sequence)` pairs for
    /// duplicate/loopback suppression (spec §4.9).
    seen: parking_lot::Mutex<std::collections::VecDeque<(i32, u32)>>,
}

const SEEN_WINDOW: usize = 256;

impl MulticastDiscovery {
    pub fn bind(local_node_id: i32) -> anyhow::Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating multicast socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;
        socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into()).context("converting multicast socket to tokio")?;

        Ok(Self {
            socket,
            local_node_id,
            sequence: AtomicU32::new(0),
            seen: parking_lot::Mutex::new(std::collections::VecDeque::with_capacity(SEEN_WINDOW)),
        })
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn frame(&self, kind: MulticastKind, ip: &str, port: i32, public_ip: &str, public_port: i32, is_public: bool) -> MulticastFrame {
        MulticastFrame {
            kind,
            node_id: self.local_node_id,
            ip: ip.to_string(),
            port,
            public_ip: public_ip.to_string(),
            public_port,
            is_public,
            timestamp: now_unix(),
            sequence: self.next_sequence(),
        }
    }

    /// Broadcasts an ANNOUNCE carrying this node's local/public endpoint
    /// (spec §4.9 "Emits an ANNOUNCE every 5s").
    pub async fn announce(&self, ip: &str, port: i32, public_ip: &str, public_port: i32, is_public: bool) -> anyhow::Result<()> {
        let frame = self.frame(MulticastKind::Announce, ip, port, public_ip, public_port, is_public);
        self.send(&frame).await
    }

    /// Broadcasts a QUERY (spec §4.9 "Emits... a QUERY every 15s").
    pub async fn query(&self, ip: &str, port: i32, public_ip: &str, public_port: i32, is_public: bool) -> anyhow::Result<()> {
        let frame = self.frame(MulticastKind::Query, ip, port, public_ip, public_port, is_public);
        self.send(&frame).await
    }

    /// Replies in kind to a QUERY from a previously-unknown peer (spec
    /// §4.9 "A received QUERY from an unknown peer triggers an extra
    /// ANNOUNCE").
    pub async fn respond(&self, ip: &str, port: i32, public_ip: &str, public_port: i32, is_public: bool) -> anyhow::Result<()> {
        let frame = self.frame(MulticastKind::Response, ip, port, public_ip, public_port, is_public);
        self.send(&frame).await
    }

    async fn send(&self, frame: &MulticastFrame) -> anyhow::Result<()> {
        let target = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);
        self.socket.send_to(frame.encode().as_bytes(), target).await?;
        Ok(())
    }

    /// Receives one multicast datagram, applying duplicate/loopback
    /// suppression. Returns `None` on a 1s timeout, a decode failure, a
    /// self-originated frame, or an already-seen `(node_id, sequence)`.
    pub async fn recv(&self) -> anyhow::Result<Option<MulticastEvent>> {
        let mut buf = [0u8; 512];
        let (n, from) = match tokio::time::timeout(Duration::from_secs(1), self.socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Ok(None),
        };

        let Ok(text) = std::str::from_utf8(&buf[..n]) else {
            return Ok(None);
        };

        let Ok(frame) = MulticastFrame::decode(text) else {
            return Ok(None);
        };

        if frame.node_id == self.local_node_id {
            return Ok(None);
        }

        let mut seen = self.seen.lock();
        if seen.iter().any(|&(id, seq)| id == frame.node_id && seq == frame.sequence) {
            return Ok(None);
        }

        if seen.len() == SEEN_WINDOW {
            seen.pop_front();
        }
        seen.push_back((frame.node_id, frame.sequence));
        drop(seen);

        Ok(Some(MulticastEvent { frame, from }))
    }
}

fn now_unix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announce_and_receive_round_trip() {
        let a = MulticastDiscovery::bind(1).unwrap();
        let b = MulticastDiscovery::bind(2).unwrap();

        a.announce("10.0.0.1", 8000, "0.0.0.0", 0, false).await.unwrap();

        let event = loop {
            if let Some(event) = b.recv().await.unwrap() {
                break event;
            }
        };

        assert_eq!(event.frame.node_id, 1);
        assert_eq!(event.frame.kind, MulticastKind::Announce);
    }

    #[tokio::test]
    async fn self_originated_frames_are_suppressed() {
        let a = MulticastDiscovery::bind(1).unwrap();
        a.announce("10.0.0.1", 8000, "0.0.0.0", 0, false).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(1200), a.recv()).await;
        match result {
            Ok(Ok(None)) | Err(_) => {}
            other => panic!("expected no event, got {other:?}"),
        }
    }
}
