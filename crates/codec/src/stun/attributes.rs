//! STUN/TURN attribute (de)serialization. Each attribute type implements
//! [`Attribute`], mirroring `turn_server_codec::message::attributes`'s
//! per-type trait approach rather than one big match statement.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::MAGIC_COOKIE;
use crate::crypto::{xor_ipv4, xor_port};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    XorMappedAddress = 0x0020,
}

pub trait Attribute<'a> {
    const TYPE: AttributeType;
    type Item;

    fn encode(value: Self::Item, bytes: &mut BytesMut, transaction_id: &[u8; 12]);
    fn decode(buf: &'a [u8], transaction_id: &'a [u8]) -> Result<Self::Item, Error>;
}

fn encode_address(addr: SocketAddrV4, bytes: &mut BytesMut) {
    bytes.put_u8(0);
    bytes.put_u8(0x01); // IPv4 family
    bytes.put_u16(addr.port());
    bytes.put_slice(&addr.ip().octets());
}

fn decode_address(buf: &[u8]) -> Result<SocketAddrV4, Error> {
    if buf.len() < 8 || buf[1] != 0x01 {
        return Err(Error::InvalidInput);
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Ok(SocketAddrV4::new(ip, port))
}

fn encode_xor_address(addr: SocketAddrV4, bytes: &mut BytesMut) {
    let port = xor_port(addr.port(), MAGIC_COOKIE);
    let ip = xor_ipv4(u32::from(*addr.ip()), MAGIC_COOKIE);

    bytes.put_u8(0);
    bytes.put_u8(0x01);
    bytes.put_u16(port);
    bytes.put_slice(&ip.to_be_bytes());
}

fn decode_xor_address(buf: &[u8]) -> Result<SocketAddrV4, Error> {
    if buf.len() < 8 || buf[1] != 0x01 {
        return Err(Error::InvalidInput);
    }

    let raw_port = u16::from_be_bytes([buf[2], buf[3]]);
    let raw_ip = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    let port = xor_port(raw_port, MAGIC_COOKIE);
    let ip = Ipv4Addr::from(xor_ipv4(raw_ip, MAGIC_COOKIE));

    Ok(SocketAddrV4::new(ip, port))
}

pub struct MappedAddress;

impl<'a> Attribute<'a> for MappedAddress {
    const TYPE: AttributeType = AttributeType::MappedAddress;
    type Item = SocketAddrV4;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        encode_address(value, bytes);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        decode_address(buf)
    }
}

pub struct XorMappedAddress;

impl<'a> Attribute<'a> for XorMappedAddress {
    const TYPE: AttributeType = AttributeType::XorMappedAddress;
    type Item = SocketAddrV4;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        encode_xor_address(value, bytes);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        decode_xor_address(buf)
    }
}

pub struct XorPeerAddress;

impl<'a> Attribute<'a> for XorPeerAddress {
    const TYPE: AttributeType = AttributeType::XorPeerAddress;
    type Item = SocketAddrV4;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        encode_xor_address(value, bytes);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        decode_xor_address(buf)
    }
}

pub struct XorRelayedAddress;

impl<'a> Attribute<'a> for XorRelayedAddress {
    const TYPE: AttributeType = AttributeType::XorRelayedAddress;
    type Item = SocketAddrV4;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        encode_xor_address(value, bytes);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        decode_xor_address(buf)
    }
}

pub struct UserName;

impl<'a> Attribute<'a> for UserName {
    const TYPE: AttributeType = AttributeType::UserName;
    type Item = String;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_slice(value.as_bytes());
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf).map_err(|_| Error::InvalidInput)?.to_string())
    }
}

pub struct Realm;

impl<'a> Attribute<'a> for Realm {
    const TYPE: AttributeType = AttributeType::Realm;
    type Item = String;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_slice(value.as_bytes());
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf).map_err(|_| Error::InvalidInput)?.to_string())
    }
}

pub struct Nonce;

impl<'a> Attribute<'a> for Nonce {
    const TYPE: AttributeType = AttributeType::Nonce;
    type Item = String;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_slice(value.as_bytes());
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(buf).map_err(|_| Error::InvalidInput)?.to_string())
    }
}

pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    const TYPE: AttributeType = AttributeType::MessageIntegrity;
    type Item = &'a [u8];

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_slice(value);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(buf)
    }
}

pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    const TYPE: AttributeType = AttributeType::Lifetime;
    type Item = u32;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_u32(value);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.len() < 4 {
            return Err(Error::InvalidInput);
        }
        Ok(u32::from_be_bytes(buf[..4].try_into().unwrap()))
    }
}

/// Requested-transport: a single protocol number (17 = UDP) followed by
/// 3 reserved bytes (RFC 5766 §14.7).
pub struct RequestedTransport;

impl<'a> Attribute<'a> for RequestedTransport {
    const TYPE: AttributeType = AttributeType::RequestedTransport;
    type Item = u8;

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_u8(value);
        bytes.put_bytes(0, 3);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidInput);
        }
        Ok(buf[0])
    }
}

pub struct Data;

impl<'a> Attribute<'a> for Data {
    const TYPE: AttributeType = AttributeType::Data;
    type Item = &'a [u8];

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        bytes.put_slice(value);
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(buf)
    }
}

/// class*100+number packed as (u16 reserved/class, u8 class, u8 number)
/// followed by a UTF-8 reason phrase, per RFC 5389 §15.6.
pub struct ErrorCode;

impl<'a> Attribute<'a> for ErrorCode {
    const TYPE: AttributeType = AttributeType::ErrorCode;
    type Item = (u16, String);

    fn encode(value: Self::Item, bytes: &mut BytesMut, _transaction_id: &[u8; 12]) {
        let (code, reason) = value;
        bytes.put_u16(0);
        bytes.put_u8((code / 100) as u8);
        bytes.put_u8((code % 100) as u8);
        bytes.put_slice(reason.as_bytes());
    }

    fn decode(buf: &'a [u8], _transaction_id: &'a [u8]) -> Result<Self::Item, Error> {
        if buf.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let code = buf[2] as u16 * 100 + buf[3] as u16;
        let reason = std::str::from_utf8(&buf[4..]).map_err(|_| Error::InvalidInput)?.to_string();
        Ok((code, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_mapped_address_round_trips_spec_example() {
        let mut buf = BytesMut::new();
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 15), 50000);
        encode_xor_address(addr, &mut buf);
        assert_eq!(decode_xor_address(&buf).unwrap(), addr);
    }

    #[test]
    fn error_code_round_trips() {
        let mut buf = BytesMut::new();
        <ErrorCode as Attribute>::encode((401, "Unauthorized".to_string()), &mut buf, &[0; 12]);
        let (code, reason) = <ErrorCode as Attribute>::decode(&buf, &[]).unwrap();
        assert_eq!(code, 401);
        assert_eq!(reason, "Unauthorized");
    }
}
