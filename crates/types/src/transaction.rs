//! Transaction types for the Strata ledger.
//!
//! Transaction ids are fixed-width: the leading 8 bytes are the big-endian
//! block height at which the transaction was *generated*, followed by a
//! 32-byte hash. The applied height (the height at which the transaction was
//! included) is stored separately on the transaction and may differ from the
//! generation height.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::hash::{sha256, Hash};

/// Byte length of an address (no checksum form).
pub const ADDRESS_LEN: usize = 33;

/// Byte length of a transaction id: 8-byte generation height + 32-byte hash.
pub const TX_ID_LEN: usize = 40;

/// Generates a fixed-width byte identifier newtype.
///
/// Each generated type serializes as a raw byte string (postcard: varint
/// length + bytes) and rejects any input of the wrong length on decode.
macro_rules! define_bytes_id {
    (
        $(#[$meta:meta])*
        $name:ident, $len:expr
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Byte length of this identifier.
            pub const LEN: usize = $len;

            /// Creates the identifier from a fixed-size array.
            #[inline]
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Parses the identifier from a slice; `None` on length mismatch.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            /// Returns the raw bytes.
            #[inline]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                write_hex(f, &self.0)?;
                write!(f, ")")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write_hex(f, &self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct BytesVisitor;

                impl<'de> serde::de::Visitor<'de> for BytesVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "{} bytes", $len)
                    }

                    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<$name, E> {
                        $name::from_slice(v)
                            .ok_or_else(|| E::invalid_length(v.len(), &self))
                    }
                }

                deserializer.deserialize_bytes(BytesVisitor)
            }
        }
    };
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

define_bytes_id!(
    /// A ledger address in its raw (no-checksum) form.
    Address,
    ADDRESS_LEN
);

define_bytes_id!(
    /// A globally unique transaction id.
    ///
    /// The leading 8 bytes are the big-endian generation height; the
    /// remaining 32 bytes are a content hash.
    TransactionId,
    TX_ID_LEN
);

impl TransactionId {
    /// Builds an id from a generation height and a content hash.
    pub fn from_parts(generation_height: u64, hash: &Hash) -> Self {
        let mut bytes = [0u8; TX_ID_LEN];
        bytes[..8].copy_from_slice(&generation_height.to_be_bytes());
        bytes[8..].copy_from_slice(hash);
        Self(bytes)
    }

    /// Decodes the generation height embedded in the leading id bytes.
    pub fn generation_height(&self) -> u64 {
        let mut height = [0u8; 8];
        height.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(height)
    }
}

/// Transaction type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    /// Ordinary value transfer.
    Normal = 0,
    /// Proof-of-work solution submission.
    PowSolution = 1,
    /// Staking reward payout.
    StakingReward = 2,
    /// Multi-signature transaction.
    Multisig = 3,
}

impl TxType {
    /// Single-byte wire tag, used in secondary index keys.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag; `None` for unknown values.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TxType::Normal),
            1 => Some(TxType::PowSolution),
            2 => Some(TxType::StakingReward),
            3 => Some(TxType::Multisig),
            _ => None,
        }
    }
}

/// A ledger transaction.
///
/// Sender and receiver maps use `BTreeMap` so serialization order is
/// deterministic regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Globally unique id; leading bytes encode the generation height.
    pub id: TransactionId,
    /// Transaction type tag.
    pub tx_type: TxType,
    /// Height of the block this transaction was included in.
    pub applied_height: u64,
    /// Sending address → amount.
    pub senders: BTreeMap<Address, u128>,
    /// Receiving address → amount.
    pub receivers: BTreeMap<Address, u128>,
    /// Content checksum.
    pub checksum: Hash,
    /// Set when the transaction was assembled from local storage.
    #[serde(skip)]
    pub from_local_storage: bool,
}

impl Transaction {
    /// Serializes the transaction to its stable byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    /// Deserializes a transaction; fails loudly on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }

    /// Recomputes the content checksum over everything except the checksum
    /// itself.
    pub fn compute_checksum(&self) -> Result<Hash, CodecError> {
        let input = codec::encode(&(
            &self.id,
            self.tx_type,
            self.applied_height,
            &self.senders,
            &self.receivers,
        ))?;
        Ok(sha256(&input))
    }
}
