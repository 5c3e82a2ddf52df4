//! The node's single UDP socket (spec §4.3, C3). Binds to the configured
//! address; if that fails and `firewall_bypass` is set, falls back through
//! a list of commonly-unblocked ports, then a handful of random ports in
//! `[10000, 60000)` (grounded in `node.c`'s `create_node` and
//! `firewall.c`'s `bind_firewall_friendly_port`, spec §4.3 edge case 1).

use std::net::{SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Ports tried, in order, after the configured bind address fails and
/// firewall bypass is enabled. Matches `node.c`'s `common_ports` list with
/// the extra entries from `firewall.c`'s longer table.
pub const FALLBACK_PORTS: &[u16] = &[80, 443, 8080, 8443, 21, 22, 25, 53, 123, 5223];

/// Number of random high ports tried after [`FALLBACK_PORTS`] is
/// exhausted (spec §4.3 edge case 1).
const RANDOM_PORT_ATTEMPTS: usize = 10;
const RANDOM_PORT_RANGE: std::ops::Range<u16> = 10000..60000;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Binds `preferred`. On failure, and only when `firewall_bypass` is
    /// set, retries [`FALLBACK_PORTS`] then up to [`RANDOM_PORT_ATTEMPTS`]
    /// random high ports before giving up.
    pub fn bind(preferred: SocketAddrV4, firewall_bypass: bool) -> anyhow::Result<Self> {
        if let Ok(socket) = bind_with_reuse(preferred) {
            return Self::from_std(socket);
        }

        if !firewall_bypass {
            return Err(anyhow!("failed to bind {preferred}"));
        }

        log::warn!("failed to bind {preferred}, trying firewall-friendly ports");

        for port in FALLBACK_PORTS {
            let candidate = SocketAddrV4::new(*preferred.ip(), *port);
            if let Ok(socket) = bind_with_reuse(candidate) {
                log::info!("bound to firewall-friendly port {port}");
                return Self::from_std(socket);
            }
        }

        let mut rng = rand::rng();
        for _ in 0..RANDOM_PORT_ATTEMPTS {
            let port = rng.random_range(RANDOM_PORT_RANGE);
            let candidate = SocketAddrV4::new(*preferred.ip(), port);
            if let Ok(socket) = bind_with_reuse(candidate) {
                log::info!("bound to random port {port}");
                return Self::from_std(socket);
            }
        }

        Err(anyhow!("failed to bind socket to any port"))
    }

    fn from_std(socket: StdUdpSocket) -> anyhow::Result<Self> {
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket).context("converting std socket to tokio")?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> anyhow::Result<usize> {
        Ok(self.socket.send_to(buf, target).await?)
    }

    /// Waits at most [`RECV_TIMEOUT`] (1s, spec §4.3) for a datagram.
    /// `Ok(None)` on timeout, matching the original's blocking
    /// `recvfrom` with `SO_RCVTIMEO`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        match timeout(RECV_TIMEOUT, self.socket.recv_from(buf)).await {
            Ok(result) => Ok(Some(result?)),
            Err(_elapsed) => Ok(None),
        }
    }
}

fn bind_with_reuse(addr: SocketAddrV4) -> std::io::Result<StdUdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_to_an_ephemeral_port() {
        let endpoint = UdpEndpoint::bind(SocketAddrV4::new([127, 0, 0, 1].into(), 0), false).unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn send_and_receive_round_trips() {
        let a = UdpEndpoint::bind(SocketAddrV4::new([127, 0, 0, 1].into(), 0), false).unwrap();
        let b = UdpEndpoint::bind(SocketAddrV4::new([127, 0, 0, 1].into(), 0), false).unwrap();

        let b_addr = b.local_addr().unwrap();
        a.send_to(b"hello", b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _from) = b.recv_from(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn recv_times_out_with_no_traffic() {
        let endpoint = UdpEndpoint::bind(SocketAddrV4::new([127, 0, 0, 1].into(), 0), false).unwrap();
        let mut buf = [0u8; 16];
        let result = endpoint.recv_from(&mut buf).await.unwrap();
        assert!(result.is_none());
    }
}
