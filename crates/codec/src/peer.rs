//! Framing for the peer datagram, big-endian on the wire (see spec §4.1,
//! §9 "binding host byte order").

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

/// Maximum application payload carried by a single peer datagram.
pub const MAX_DATA_LEN: usize = 1024;

/// Fixed header size: type(1) + seq(4) + from_id(4) + to_id(4) + data_len(2).
pub const HEADER_LEN: usize = 1 + 4 + 4 + 4 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Data = 0,
    Ping = 1,
    Pong = 2,
    PeerList = 3,
    NatTraversal = 4,
    DhtPing = 5,
    DhtPong = 6,
    DhtFindNode = 7,
    DhtFindNodeReply = 8,
    DhtFindValue = 9,
    DhtFindValueReply = 10,
    DhtStore = 11,
    RendezvousAnnounce = 12,
    RendezvousQuery = 13,
    RendezvousResponse = 14,
    RendezvousConnect = 15,
}

/// A single peer datagram: `{ type, seq, from_id, to_id, data_len, data }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFrame {
    pub kind: MessageType,
    pub seq: u32,
    pub from_id: i32,
    pub to_id: i32,
    pub data: Vec<u8>,
}

impl PeerFrame {
    pub fn new(kind: MessageType, seq: u32, from_id: i32, to_id: i32, data: Vec<u8>) -> Result<Self, Error> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            kind,
            seq,
            from_id,
            to_id,
            data,
        })
    }

    /// Demultiplex hint: the peer socket multiplexes peer datagrams (first
    /// byte is a small message-type integer) against STUN/TURN frames
    /// (first byte's top two bits are the STUN class field, always zero
    /// for a class-0/1/2/3 STUN header since every `MessageType` variant
    /// here is below 16 and STUN method high bits live above that range in
    /// practice this is disambiguated by the caller trying STUN decode
    /// first and falling back to peer-frame decode, per spec §4.1).
    pub fn encode(&self, out: &mut BytesMut) {
        out.clear();
        out.put_u8(self.kind.into());
        out.put_u32(self.seq);
        out.put_i32(self.from_id);
        out.put_i32(self.to_id);
        out.put_u16(self.data.len() as u16);
        out.put_slice(&self.data);
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        let kind = MessageType::try_from(bytes.get_u8()).map_err(|_| Error::UnknownType)?;
        let seq = bytes.get_u32();
        let from_id = bytes.get_i32();
        let to_id = bytes.get_i32();
        let data_len = bytes.get_u16() as usize;

        if data_len > MAX_DATA_LEN || bytes.remaining() < data_len {
            return Err(Error::InvalidInput);
        }

        let data = bytes[..data_len].to_vec();

        Ok(Self {
            kind,
            seq,
            from_id,
            to_id,
            data,
        })
    }
}

/// Format `count,id:ip:port:pub_ip:pub_port:is_public,...` used by the
/// PEER_LIST message (spec §4.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerListEntry {
    pub id: i32,
    pub ip: String,
    pub port: u16,
    pub public_ip: String,
    pub public_port: u16,
    pub is_public: bool,
}

pub fn encode_peer_list(entries: &[PeerListEntry]) -> String {
    let mut out = format!("{}", entries.len());
    for e in entries {
        out.push(',');
        out.push_str(&format!(
            "{}:{}:{}:{}:{}:{}",
            e.id,
            e.ip,
            e.port,
            e.public_ip,
            e.public_port,
            if e.is_public { 1 } else { 0 },
        ));
    }
    out
}

pub fn decode_peer_list(s: &str) -> Result<Vec<PeerListEntry>, Error> {
    let mut parts = s.split(',');
    let count: usize = parts
        .next()
        .ok_or(Error::InvalidInput)?
        .parse()
        .map_err(|_| Error::InvalidInput)?;

    let mut out = Vec::with_capacity(count);
    for part in parts {
        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() != 6 {
            return Err(Error::InvalidInput);
        }

        out.push(PeerListEntry {
            id: fields[0].parse().map_err(|_| Error::InvalidInput)?,
            ip: fields[1].to_string(),
            port: fields[2].parse().map_err(|_| Error::InvalidInput)?,
            public_ip: fields[3].to_string(),
            public_port: fields[4].parse().map_err(|_| Error::InvalidInput)?,
            is_public: fields[5] == "1",
        });
    }

    if out.len() != count {
        return Err(Error::InvalidInput);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let frame = PeerFrame::new(MessageType::Data, 7, 1, 2, b"hi".to_vec()).unwrap();
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(PeerFrame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn rejects_oversized_payload() {
        let data = vec![0u8; MAX_DATA_LEN + 1];
        assert!(PeerFrame::new(MessageType::Data, 0, 0, 0, data).is_err());
    }

    #[test]
    fn peer_list_round_trips() {
        let entries = vec![PeerListEntry {
            id: 1,
            ip: "127.0.0.1".into(),
            port: 8000,
            public_ip: "0.0.0.0".into(),
            public_port: 0,
            is_public: false,
        }];

        let encoded = encode_peer_list(&entries);
        assert_eq!(decode_peer_list(&encoded).unwrap(), entries);
    }
}
