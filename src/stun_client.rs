//! STUN client (spec §4.3, C4): one binding transaction against a named
//! host, returning the reflexive endpoint. The teacher only implements
//! the server side of this exchange; the request/response framing here
//! is built on `codec::stun`, the same wire layer the server decodes.

use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use codec::stun::attributes::{MappedAddress, XorMappedAddress};
use codec::stun::{Attributes, Message, MessageType, MessageWriter};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves `stun_host` (`host:port`), sends a single BINDING_REQUEST
/// from an ephemeral socket, and returns the reflexive address found in
/// XOR-MAPPED-ADDRESS (preferred) or MAPPED-ADDRESS (spec §4.3).
pub async fn discover_reflexive_address(stun_host: &str) -> anyhow::Result<SocketAddrV4> {
    let target = lookup_host(stun_host)
        .await
        .context("resolving STUN host")?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("STUN host {stun_host} has no IPv4 address"))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await.context("binding STUN transaction socket")?;

    let transaction_id: [u8; 12] = rand::random();
    let mut bytes = BytesMut::new();
    MessageWriter::new(MessageType::BINDING_REQUEST, transaction_id, &mut bytes).finish(None);

    socket.send_to(&bytes, target).await.context("sending STUN binding request")?;

    let mut buf = [0u8; 512];
    let (n, _from) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| anyhow!("STUN binding request timed out"))?
        .context("receiving STUN binding response")?;

    parse_binding_response(&buf[..n], &transaction_id)
}

fn parse_binding_response(bytes: &[u8], expected_transaction_id: &[u8; 12]) -> anyhow::Result<SocketAddrV4> {
    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes)
        .map_err(|e| anyhow!("malformed STUN response: {e}"))?;

    if message.kind() != MessageType::BINDING_RESPONSE {
        return Err(anyhow!("unexpected STUN response type"));
    }

    if message.transaction_id() != expected_transaction_id {
        return Err(anyhow!("STUN transaction id mismatch"));
    }

    if let Some(addr) = message.get::<XorMappedAddress>() {
        return Ok(addr);
    }

    if let Some(addr) = message.get::<MappedAddress>() {
        return Ok(addr);
    }

    Err(anyhow!("STUN response carried no address attribute"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_response() {
        let transaction_id = [0u8; 12];
        let result = parse_binding_response(&[0u8; 4], &transaction_id);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_mismatched_transaction_id() {
        let mut bytes = BytesMut::new();
        MessageWriter::new(MessageType::BINDING_RESPONSE, [9u8; 12], &mut bytes).finish(None);

        let result = parse_binding_response(&bytes, &[1u8; 12]);
        assert!(result.is_err());
    }
}
