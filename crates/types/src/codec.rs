//! Serialization helpers shared by all stored row formats.
//!
//! Every on-disk row in the ledger store is encoded with postcard, which is
//! deterministic for a given value: the same block or transaction always
//! serializes to the same bytes across process restarts. Errors surface via
//! snafu rather than panicking.

use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("Encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("Decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { source })
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if deserialization fails. Malformed or
/// truncated input is always an error, never a partial value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_tuple() {
        let original = (42u64, vec![1u8, 2, 3]);
        let bytes = encode(&original).expect("encode");
        let decoded: (u64, Vec<u8>) = decode(&bytes).expect("decode");
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let bytes = encode(&(1u64, 2u64)).expect("encode");
        let result: Result<(u64, u64), _> = decode(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let value = vec![(1u64, "a".to_string()), (2, "b".to_string())];
        let a = encode(&value).expect("encode");
        let b = encode(&value).expect("encode");
        assert_eq!(a, b);
    }
}
