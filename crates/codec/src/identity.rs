//! 160-bit node identifiers and the XOR distance metric used by the DHT.

use sha1::{Digest, Sha1};

use crate::Error;

/// Sentinel distance returned for two identical ids. Never the index of a
/// real bucket; callers must treat it as "drop, this is the local node".
pub const SAME_NODE: u32 = 160;

/// Opaque 160-bit node identifier.
///
/// Derived either from random bytes or from the SHA-1 digest of a
/// canonical node string (`"node-<int>-<ip>-<port>"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub const LEN: usize = 20;

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate a random id using the OS RNG.
    ///
    /// # Test
    ///
    /// ```
    /// use overlay_codec::identity::NodeId;
    ///
    /// let a = NodeId::random();
    /// let b = NodeId::random();
    /// assert_ne!(a, b);
    /// ```
    pub fn random() -> Self {
        use rand::Rng;
        let mut buf = [0u8; 20];
        rand::rng().fill(&mut buf);
        Self(buf)
    }

    /// Derive an id from the canonical node string `"node-<int>-<ip>-<port>"`.
    ///
    /// # Test
    ///
    /// ```
    /// use overlay_codec::identity::NodeId;
    ///
    /// let a = NodeId::from_node_string(1, "127.0.0.1", 8000);
    /// let b = NodeId::from_node_string(1, "127.0.0.1", 8000);
    /// assert_eq!(a, b);
    /// ```
    pub fn from_node_string(id: i32, ip: &str, port: u16) -> Self {
        Self::from_str(&format!("node-{id}-{ip}-{port}"))
    }

    /// Derive an id from the SHA-1 digest of an arbitrary string (used for
    /// rendezvous key -> DHT id mapping).
    pub fn from_str(s: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(s.as_bytes());
        let digest = hasher.finalize();
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&digest);
        Self(buf)
    }

    /// Common-prefix length with `other`: the index (0..=160, most
    /// significant bit first) of the first differing bit. `160` means the
    /// two ids are identical.
    ///
    /// # Test
    ///
    /// ```
    /// use overlay_codec::identity::NodeId;
    ///
    /// let a = NodeId::from_bytes([0u8; 20]);
    /// let mut other = [0u8; 20];
    /// other[0] = 0x80;
    /// let b = NodeId::from_bytes(other);
    ///
    /// assert_eq!(a.distance(&a), 160);
    /// assert_eq!(a.distance(&b), 0);
    /// ```
    pub fn distance(&self, other: &Self) -> u32 {
        for byte_idx in 0..Self::LEN {
            let xor = self.0[byte_idx] ^ other.0[byte_idx];
            if xor != 0 {
                return (byte_idx as u32) * 8 + xor.leading_zeros();
            }
        }
        SAME_NODE
    }

    /// XOR the two ids together, byte by byte, as an unsigned 160-bit
    /// big-endian integer suitable for distance comparisons.
    pub fn xor(&self, other: &Self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for i in 0..Self::LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Flip bit `bit_index` (0 = most significant bit) of this id, used by
    /// DHT bucket refresh to generate a random id inside a bucket's range.
    pub fn flip_bit(&self, bit_index: u32) -> Self {
        let mut out = self.0;
        let byte = (bit_index / 8) as usize;
        let bit_in_byte = 7 - (bit_index % 8);
        out[byte] ^= 1 << bit_in_byte;
        Self(out)
    }

    /// Encode as 40 lowercase hex digits.
    ///
    /// # Test
    ///
    /// ```
    /// use overlay_codec::identity::NodeId;
    ///
    /// let id = NodeId::from_bytes([0xabu8; 20]);
    /// let hex = id.to_hex();
    /// assert_eq!(hex.len(), 40);
    /// assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    /// ```
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(40);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Decode 40 lowercase hex digits. Rejects any input whose
    /// non-whitespace length is less than 40.
    ///
    /// # Test
    ///
    /// ```
    /// use overlay_codec::identity::NodeId;
    ///
    /// let id = NodeId::from_bytes([0xabu8; 20]);
    /// let hex = id.to_hex();
    /// assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
    /// assert!(NodeId::from_hex("too short").is_err());
    /// ```
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let trimmed: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if trimmed.len() < 40 {
            return Err(Error::InvalidInput);
        }

        let mut buf = [0u8; 20];
        for i in 0..20 {
            let byte_str = &trimmed[i * 2..i * 2 + 2];
            buf[i] = u8::from_str_radix(byte_str, 16).map_err(|_| Error::InvalidInput)?;
        }

        Ok(Self(buf))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_ultrametric() {
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&c) <= a.distance(&b).max(b.distance(&c)));
    }

    #[test]
    fn hex_round_trip() {
        for _ in 0..16 {
            let id = NodeId::random();
            let hex = id.to_hex();
            assert_eq!(hex.len(), 40);
            assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
        }
    }

    #[test]
    fn flip_bit_changes_only_target_bit() {
        let id = NodeId::from_bytes([0u8; 20]);
        let flipped = id.flip_bit(3);
        assert_eq!(id.distance(&flipped), 3);
    }
}
