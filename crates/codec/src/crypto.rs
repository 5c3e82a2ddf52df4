//! Cryptographic primitives used by the STUN/TURN codec path. Deliberately
//! not the source's ad-hoc XOR "HMAC" (see spec §9) — this uses reviewed
//! primitives from `aws-lc-rs`.

use aws_lc_rs::hmac;
use md5::{Digest, Md5};

/// HMAC-SHA1 over the concatenation of `source`, used for STUN
/// MESSAGE-INTEGRITY.
///
/// # Test
///
/// ```
/// use overlay_codec::crypto::hmac_sha1;
///
/// let a = hmac_sha1(b"key", &[b"hello", b" world"]);
/// let b = hmac_sha1(b"key", &[b"hello world"]);
/// assert_eq!(a, b);
/// ```
pub fn hmac_sha1(key: &[u8], source: &[&[u8]]) -> [u8; 20] {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    let mut ctx = hmac::Context::with_key(&key);
    for chunk in source {
        ctx.update(chunk);
    }

    let signature = ctx.sign();
    let mut out = [0u8; 20];
    out.copy_from_slice(signature.as_ref());
    out
}

/// Long-term credential key: `MD5(username ":" realm ":" password)`.
///
/// # Test
///
/// ```
/// use overlay_codec::crypto::long_term_key;
///
/// let a = long_term_key("alice", "example.org", "hunter2");
/// let b = long_term_key("alice", "example.org", "hunter2");
/// assert_eq!(a, b);
/// ```
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update([username, realm, password].join(":"));
    hasher.finalize().into()
}

/// Unmask an XOR-MAPPED/XOR-PEER/XOR-RELAYED port: XOR with the top 16 bits
/// of the magic cookie.
pub fn xor_port(port: u16, magic_cookie: u32) -> u16 {
    port ^ (magic_cookie >> 16) as u16
}

/// Unmask an XOR-MAPPED/XOR-PEER/XOR-RELAYED IPv4 address: XOR with the
/// full magic cookie.
pub fn xor_ipv4(ip: u32, magic_cookie: u32) -> u32 {
    ip ^ magic_cookie
}
