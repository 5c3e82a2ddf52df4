//! STUN (RFC 5389) / TURN (RFC 5766) framing: 16-bit type, 16-bit length,
//! the magic cookie, a 96-bit transaction id, and TLV attributes padded to
//! a 4-byte boundary (spec §4.1, §6).

pub mod attributes;

use bytes::{BufMut, BytesMut};

use crate::{crypto::hmac_sha1, Error};
use attributes::{Attribute, AttributeType};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;

/// Raw STUN/TURN message type (class + method, as laid out on the wire).
/// Named constants cover every message this node emits or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType(pub u16);

impl MessageType {
    pub const BINDING_REQUEST: Self = Self(0x0001);
    pub const BINDING_RESPONSE: Self = Self(0x0101);
    pub const ALLOCATE_REQUEST: Self = Self(0x0003);
    pub const ALLOCATE_RESPONSE: Self = Self(0x0103);
    pub const ALLOCATE_ERROR: Self = Self(0x0113);
    pub const REFRESH_REQUEST: Self = Self(0x0004);
    pub const REFRESH_RESPONSE: Self = Self(0x0104);
    pub const REFRESH_ERROR: Self = Self(0x0114);
    pub const CREATE_PERMISSION_REQUEST: Self = Self(0x0008);
    pub const CREATE_PERMISSION_RESPONSE: Self = Self(0x0108);
    pub const SEND_INDICATION: Self = Self(0x0016);
    pub const DATA_INDICATION: Self = Self(0x0017);

    /// Whether the leading byte of an encoded message looks like a STUN
    /// header (top two bits of the type field are always zero for STUN),
    /// used by the dispatcher to tell STUN/TURN frames apart from peer
    /// datagrams sharing the same socket.
    pub fn looks_like_stun(first_byte: u8) -> bool {
        first_byte >> 6 == 0
    }
}

/// Attribute TLV index built while decoding; mirrors the approach in
/// `turn_server_codec::Attributes` (a flat Vec is faster than a HashMap for
/// the handful of attributes a STUN/TURN message carries).
#[derive(Debug, Default, Clone)]
pub struct Attributes(Vec<(AttributeType, std::ops::Range<usize>)>);

impl Attributes {
    pub fn append(&mut self, kind: AttributeType, range: std::ops::Range<usize>) {
        self.0.push((kind, range));
    }

    pub fn get(&self, kind: AttributeType) -> Option<std::ops::Range<usize>> {
        self.0.iter().find(|(k, _)| *k == kind).map(|(_, r)| r.clone())
    }
}

pub struct Message<'a> {
    kind: MessageType,
    bytes: &'a [u8],
    attributes: &'a Attributes,
}

impl<'a> Message<'a> {
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn transaction_id(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(T::TYPE)?;
        T::decode(&self.bytes[range], self.transaction_id()).ok()
    }

    /// Verify MESSAGE-INTEGRITY against a long-term-credential key.
    pub fn verify_integrity(&self, key: &[u8]) -> Result<(), Error> {
        let range = self
            .attributes
            .get(AttributeType::MessageIntegrity)
            .ok_or(Error::NotFoundIntegrity)?;

        let mac_start = range.start - 4;
        let mut header_with_len = [0u8; 2];
        header_with_len.copy_from_slice(&((mac_start + 24 - HEADER_LEN) as u16).to_be_bytes());

        let mut scratch = BytesMut::from(&self.bytes[..mac_start]);
        scratch[2..4].copy_from_slice(&header_with_len);

        let expected = hmac_sha1(key, &[&scratch]);
        let actual = &self.bytes[range];

        if expected.as_slice() == actual {
            Ok(())
        } else {
            Err(Error::IntegrityFailed)
        }
    }

    /// Decode a STUN/TURN message. `attributes` is caller-owned scratch
    /// space so repeated decodes on a hot receive loop don't allocate.
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        attributes.0.clear();

        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        let kind = MessageType(u16::from_be_bytes([bytes[0], bytes[1]]));
        let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        if bytes.len() < HEADER_LEN + body_len {
            return Err(Error::InvalidInput);
        }

        if bytes[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        let mut offset = HEADER_LEN;
        let end = HEADER_LEN + body_len;

        while end - offset >= 4 {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if end - offset < attr_len {
                break;
            }

            let range = offset..offset + attr_len;
            offset += attr_len + alignment_32(attr_len);

            if let Ok(kind) = AttributeType::try_from(attr_type) {
                attributes.append(kind, range);
            }
        }

        Ok(Self {
            kind,
            bytes,
            attributes,
        })
    }

    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        Ok(HEADER_LEN + u16::from_be_bytes([bytes[2], bytes[3]]) as usize)
    }
}

pub struct MessageWriter<'a> {
    bytes: &'a mut BytesMut,
    transaction_id: [u8; 12],
}

impl<'a> MessageWriter<'a> {
    pub fn new(kind: MessageType, transaction_id: [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(kind.0);
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_COOKIE);
        bytes.put_slice(&transaction_id);

        Self {
            bytes,
            transaction_id,
        }
    }

    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE as u16);

        let size_pos = self.bytes.len();
        self.bytes.put_u16(0);

        let start = self.bytes.len();
        T::encode(value, self.bytes, &self.transaction_id);
        let size = self.bytes.len() - start;

        self.bytes[size_pos..size_pos + 2].copy_from_slice(&(size as u16).to_be_bytes());

        let pad = alignment_32(size);
        if pad > 0 {
            self.bytes.put_bytes(0, pad);
        }
    }

    /// Finalize the header length field, optionally appending
    /// MESSAGE-INTEGRITY computed with the given long-term-credential key.
    pub fn finish(mut self, key: Option<&[u8]>) {
        self.set_len(self.bytes.len() - HEADER_LEN);

        if let Some(key) = key {
            self.append_integrity(key);
        }
    }

    fn append_integrity(&mut self, key: &[u8]) {
        let len_with_integrity = self.bytes.len() - HEADER_LEN + 4 + 20;
        self.set_len(len_with_integrity);

        let mac = hmac_sha1(key, &[&self.bytes[..]]);
        self.bytes.put_u16(AttributeType::MessageIntegrity as u16);
        self.bytes.put_u16(20);
        self.bytes.put_slice(&mac);
    }

    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    }
}

#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let rem = size % 4;
    if rem == 0 {
        0
    } else {
        4 - rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attributes::{Lifetime, UserName, XorMappedAddress};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn binding_request_round_trips_with_xor_mapped_address() {
        let mut buf = BytesMut::new();
        let tx = [1u8; 12];
        let mut writer = MessageWriter::new(MessageType::BINDING_RESPONSE, tx, &mut buf);
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 15), 50000);
        writer.append::<XorMappedAddress>(addr);
        writer.append::<UserName>("alice");
        writer.append::<Lifetime>(600);
        writer.finish(None);

        let mut attrs = Attributes::default();
        let message = Message::decode(&buf, &mut attrs).unwrap();

        assert_eq!(message.kind(), MessageType::BINDING_RESPONSE);
        assert_eq!(message.get::<XorMappedAddress>(), Some(addr));
        assert_eq!(message.get::<UserName>(), Some("alice".to_string()));
        assert_eq!(message.get::<Lifetime>(), Some(600));
    }

    #[test]
    fn message_integrity_verifies() {
        let mut buf = BytesMut::new();
        let tx = [7u8; 12];
        let key = b"secret-key";
        let mut writer = MessageWriter::new(MessageType::ALLOCATE_REQUEST, tx, &mut buf);
        writer.append::<UserName>("bob");
        writer.finish(Some(key));

        let mut attrs = Attributes::default();
        let message = Message::decode(&buf, &mut attrs).unwrap();
        assert!(message.verify_integrity(key).is_ok());
        assert!(message.verify_integrity(b"wrong-key").is_err());
    }
}
