//! DHT RPC body carried inside a peer datagram's `data` field when its
//! `MessageType` is one of the `Dht*` variants (spec §4.1, §6). Grounded
//! on `dht.h`'s `DhtMessage`: `{ sender_id, target_id, transaction_id,
//! data_len, data }`, rendered big-endian per spec §9's binding-byte-order
//! redesign rather than the original's host-order struct layout.

use bytes::{Buf, BufMut, BytesMut};

use crate::identity::NodeId;
use crate::peer::MAX_DATA_LEN as PEER_MAX_DATA_LEN;
use crate::Error;

/// `sender_id(20) + target_id(20) + transaction_id(4) + data_len(2)`.
pub const HEADER_LEN: usize = NodeId::LEN * 2 + 4 + 2;

/// Leaves room for the outer peer-frame header inside the 1024-byte
/// payload budget.
pub const MAX_DATA_LEN: usize = PEER_MAX_DATA_LEN - HEADER_LEN;

/// A DHT RPC: PING/PONG carry empty `data`; FIND_NODE/FIND_VALUE/STORE
/// carry a request- or reply-specific encoding in `data` (see
/// [`crate::dht_rpc::contacts`] and [`crate::dht_rpc::store_payload`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtRpc {
    pub sender_id: NodeId,
    pub target_id: NodeId,
    pub transaction_id: u32,
    pub data: Vec<u8>,
}

impl DhtRpc {
    pub fn new(sender_id: NodeId, target_id: NodeId, transaction_id: u32, data: Vec<u8>) -> Result<Self, Error> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            sender_id,
            target_id,
            transaction_id,
            data,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.clear();
        out.put_slice(self.sender_id.as_bytes());
        out.put_slice(self.target_id.as_bytes());
        out.put_u32(self.transaction_id);
        out.put_u16(self.data.len() as u16);
        out.put_slice(&self.data);
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        let mut sender_bytes = [0u8; NodeId::LEN];
        bytes.copy_to_slice(&mut sender_bytes);
        let mut target_bytes = [0u8; NodeId::LEN];
        bytes.copy_to_slice(&mut target_bytes);
        let transaction_id = bytes.get_u32();
        let data_len = bytes.get_u16() as usize;

        if data_len > MAX_DATA_LEN || bytes.remaining() < data_len {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            sender_id: NodeId::from_bytes(sender_bytes),
            target_id: NodeId::from_bytes(target_bytes),
            transaction_id,
            data: bytes[..data_len].to_vec(),
        })
    }
}

/// Wire format for a single contact inside a FIND_NODE_REPLY/FIND_VALUE's
/// miss path: `node_id(20) + ip(4) + port(2)`.
pub mod contacts {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    const ENTRY_LEN: usize = NodeId::LEN + 4 + 2;

    pub fn encode(entries: &[(NodeId, SocketAddrV4)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(entries.len() * ENTRY_LEN);
        for (id, endpoint) in entries {
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&endpoint.ip().octets());
            out.extend_from_slice(&endpoint.port().to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Vec<(NodeId, SocketAddrV4)>, Error> {
        if bytes.len() % ENTRY_LEN != 0 {
            return Err(Error::InvalidInput);
        }

        let mut out = Vec::with_capacity(bytes.len() / ENTRY_LEN);
        for chunk in bytes.chunks_exact(ENTRY_LEN) {
            let mut id_bytes = [0u8; NodeId::LEN];
            id_bytes.copy_from_slice(&chunk[..NodeId::LEN]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            out.push((NodeId::from_bytes(id_bytes), SocketAddrV4::new(ip, port)));
        }
        Ok(out)
    }
}

/// Wire format for a STORE request's payload: the 20-byte key this RPC's
/// `target_id` already carries, followed by the value bytes verbatim (the
/// `data` field itself, so `store_payload` is just an alias for clarity
/// at call sites).
pub mod store_payload {
    pub fn encode(value: &[u8]) -> Vec<u8> {
        value.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> &[u8] {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn rpc_round_trips() {
        let rpc = DhtRpc::new(NodeId::random(), NodeId::random(), 7, b"hi".to_vec()).unwrap();
        let mut buf = BytesMut::new();
        rpc.encode(&mut buf);
        assert_eq!(DhtRpc::decode(&buf).unwrap(), rpc);
    }

    #[test]
    fn contacts_round_trip() {
        let entries = vec![
            (NodeId::random(), SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9000)),
            (NodeId::random(), SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9001)),
        ];

        let encoded = contacts::encode(&entries);
        assert_eq!(contacts::decode(&encoded).unwrap(), entries);
    }
}
