//! Wire codecs for the overlay node.
//!
//! Three framed message families share the node's single UDP socket (spec
//! §4.1): the [`peer`] datagram, [`stun`] (STUN/TURN, used for reflexive
//! address discovery and relaying), and [`discovery`] (LAN multicast and
//! directory-gossip records). [`dht_rpc`] and [`rendezvous_rpc`] are the
//! bodies carried inside a peer datagram's `data` field for DHT and
//! rendezvous message kinds. [`identity`] defines the 160-bit node id and
//! XOR distance metric the DHT is built on.

pub mod crypto;
pub mod discovery;
pub mod dht_rpc;
pub mod identity;
pub mod peer;
pub mod rendezvous_rpc;
pub mod stun;

use std::array::TryFromSliceError;
use std::str::Utf8Error;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownType,
    NotFoundMagicNumber,
    NotFoundIntegrity,
    IntegrityFailed,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}
