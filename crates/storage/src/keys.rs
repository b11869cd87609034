//! Key construction for partition tables.
//!
//! Every row key in a partition is a combined key: a two-byte big-endian
//! length prefix for the primary component, the primary component itself,
//! then the secondary component. Combined keys sort first by primary
//! length, then by primary bytes, then by secondary bytes, which keeps all
//! rows sharing a primary component adjacent for range scans.
//!
//! Index tables store 16-byte truncated prefixes of addresses and
//! transaction ids instead of the full values. This bounds index key size
//! but admits prefix collisions, so every index hit must be verified
//! against the full row it points at before being returned.

use snafu::Snafu;
use strata_types::{TransactionId, TxType};

/// Truncated prefix length used in index keys.
pub const KEY_PREFIX_LEN: usize = 16;

/// Record-kind suffixes for block rows, one row per fragment.
pub const BLOCK_RECORD_HEADER: &[u8] = &[0];
pub const BLOCK_RECORD_TX_IDS: &[u8] = &[1];
pub const BLOCK_RECORD_SIGNERS: &[u8] = &[2];
pub const BLOCK_RECORD_SIGNERS_COMPACT: &[u8] = &[3];

/// Secondary component of the height -> checksum primary index rows.
pub const BLOCK_PRIMARY_INDEX: &[u8] = &[0];

/// Record-kind suffix for transaction body rows.
pub const TX_RECORD_BODY: &[u8] = &[0];

/// Key construction and parsing errors.
#[derive(Debug, Snafu)]
pub enum KeyError {
    /// The primary component does not fit the two-byte length prefix.
    #[snafu(display("Primary key component too long: {len} bytes"))]
    PrimaryTooLong {
        /// Length of the rejected component.
        len: usize,
    },

    /// A stored key could not be split back into its components.
    #[snafu(display("Malformed combined key: {reason}"))]
    Malformed {
        /// What failed to parse.
        reason: &'static str,
    },
}

/// Builds a combined key from a primary and a secondary component.
///
/// # Errors
///
/// Returns [`KeyError::PrimaryTooLong`] if `primary` exceeds 65535 bytes.
pub fn combine_keys(primary: &[u8], secondary: &[u8]) -> Result<Vec<u8>, KeyError> {
    let len = u16::try_from(primary.len()).map_err(|_| KeyError::PrimaryTooLong {
        len: primary.len(),
    })?;
    let mut key = Vec::with_capacity(2 + primary.len() + secondary.len());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(primary);
    key.extend_from_slice(secondary);
    Ok(key)
}

/// Splits a combined key back into its primary and secondary components.
///
/// # Errors
///
/// Returns [`KeyError::Malformed`] if the key is shorter than its declared
/// primary component. Stored keys are produced by [`combine_keys`], so a
/// parse failure here means the table is corrupt and must not be ignored.
pub fn split_combined(key: &[u8]) -> Result<(&[u8], &[u8]), KeyError> {
    if key.len() < 2 {
        return Err(KeyError::Malformed {
            reason: "missing length prefix",
        });
    }
    let len = u16::from_be_bytes([key[0], key[1]]) as usize;
    if key.len() < 2 + len {
        return Err(KeyError::Malformed {
            reason: "primary component truncated",
        });
    }
    Ok((&key[2..2 + len], &key[2 + len..]))
}

/// Returns the 16-byte index prefix of a full address or transaction id.
pub fn key_prefix(full: &[u8]) -> &[u8] {
    &full[..KEY_PREFIX_LEN]
}

/// Builds the secondary fragment of an address-index entry: the applied
/// height followed by a truncated transaction id.
pub fn applied_and_txid_fragment(applied_height: u64, id: &TransactionId) -> [u8; 24] {
    let mut fragment = [0u8; 24];
    fragment[..8].copy_from_slice(&applied_height.to_be_bytes());
    fragment[8..].copy_from_slice(key_prefix(id.as_bytes()));
    fragment
}

/// Parses an address-index fragment back into an applied height and a
/// truncated transaction id prefix.
///
/// # Errors
///
/// Returns [`KeyError::Malformed`] if the fragment has the wrong length.
pub fn parse_applied_and_txid(fragment: &[u8]) -> Result<(u64, &[u8]), KeyError> {
    if fragment.len() != 8 + KEY_PREFIX_LEN {
        return Err(KeyError::Malformed {
            reason: "bad applied-height fragment length",
        });
    }
    let mut height = [0u8; 8];
    height.copy_from_slice(&fragment[..8]);
    Ok((u64::from_be_bytes(height), &fragment[8..]))
}

/// Builds the secondary fragment of an applied-height index entry: the
/// transaction type byte followed by a truncated transaction id.
pub fn type_and_txid_fragment(tx_type: TxType, id: &TransactionId) -> [u8; 17] {
    let mut fragment = [0u8; 17];
    fragment[0] = tx_type.as_u8();
    fragment[1..].copy_from_slice(key_prefix(id.as_bytes()));
    fragment
}

/// Parses an applied-height index fragment back into a transaction type
/// and a truncated transaction id prefix.
///
/// # Errors
///
/// Returns [`KeyError::Malformed`] if the fragment has the wrong length or
/// an unknown type byte.
pub fn parse_type_and_txid(fragment: &[u8]) -> Result<(TxType, &[u8]), KeyError> {
    if fragment.len() != 1 + KEY_PREFIX_LEN {
        return Err(KeyError::Malformed {
            reason: "bad type fragment length",
        });
    }
    let tx_type = TxType::from_u8(fragment[0]).ok_or(KeyError::Malformed {
        reason: "unknown transaction type byte",
    })?;
    Ok((tx_type, &fragment[1..]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use strata_types::ZERO_HASH;

    #[test]
    fn test_combine_and_split_roundtrip() {
        let key = combine_keys(b"primary", b"secondary").expect("combine");
        let (primary, secondary) = split_combined(&key).expect("split");
        assert_eq!(primary, b"primary");
        assert_eq!(secondary, b"secondary");
    }

    #[test]
    fn test_combine_empty_components() {
        let key = combine_keys(b"", b"").expect("combine");
        let (primary, secondary) = split_combined(&key).expect("split");
        assert!(primary.is_empty());
        assert!(secondary.is_empty());
    }

    #[test]
    fn test_combined_keys_group_by_primary() {
        let a0 = combine_keys(b"aaaa", &[0]).expect("combine");
        let a1 = combine_keys(b"aaaa", &[1]).expect("combine");
        let b0 = combine_keys(b"aaab", &[0]).expect("combine");
        assert!(a0 < a1);
        assert!(a1 < b0);
    }

    #[test]
    fn test_split_rejects_truncated_key() {
        let mut key = combine_keys(b"primary", b"").expect("combine");
        key.truncate(4);
        assert!(split_combined(&key).is_err());
        assert!(split_combined(&[0x00]).is_err());
    }

    #[test]
    fn test_combine_rejects_oversized_primary() {
        let primary = vec![0u8; 70_000];
        assert!(combine_keys(&primary, b"x").is_err());
    }

    #[test]
    fn test_applied_fragment_roundtrip() {
        let id = TransactionId::from_parts(42, &ZERO_HASH);
        let fragment = applied_and_txid_fragment(42, &id);
        let (height, prefix) = parse_applied_and_txid(&fragment).expect("parse");
        assert_eq!(height, 42);
        assert_eq!(prefix, key_prefix(id.as_bytes()));
    }

    #[test]
    fn test_type_fragment_roundtrip() {
        let id = TransactionId::from_parts(7, &ZERO_HASH);
        let fragment = type_and_txid_fragment(TxType::PowSolution, &id);
        let (tx_type, prefix) = parse_type_and_txid(&fragment).expect("parse");
        assert_eq!(tx_type, TxType::PowSolution);
        assert_eq!(prefix, key_prefix(id.as_bytes()));
    }

    #[test]
    fn test_type_fragment_rejects_unknown_type() {
        let mut fragment = [0u8; 17];
        fragment[0] = 0xff;
        assert!(parse_type_and_txid(&fragment).is_err());
    }
}
