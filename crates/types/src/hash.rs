//! Cryptographic hashing for the Strata ledger.
//!
//! All checksums are SHA-256. Block checksums are computed over the
//! serialized header bytes so that a block read back from storage can be
//! verified without re-serializing the whole block.

use sha2::{Digest, Sha256};

/// SHA-256 hash output (32 bytes).
pub type Hash = [u8; 32];

/// Zero hash: 32 zero bytes. Used only as the genesis previous-checksum.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute SHA-256 hash of arbitrary data.
#[inline]
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_stable() {
        let a = sha256(b"strata");
        let b = sha256(b"strata");
        assert_eq!(a, b);
        assert_ne!(a, ZERO_HASH);
    }

    #[test]
    fn test_sha256_empty_input() {
        // SHA-256("") is the well-known constant, not zero bytes.
        let h = sha256(b"");
        assert_eq!(h[0], 0xe3);
        assert_eq!(h[31], 0x55);
    }
}
