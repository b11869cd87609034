//! Block types for the Strata ledger.
//!
//! A block's storable form is three independent byte fragments (header,
//! signature set, transaction-id list) plus derived metadata. The storage
//! layer persists the fragments separately and re-assembles them on read;
//! the byte-concatenation accessors here match that row layout exactly so
//! stored blocks can be relayed without deserialization.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::hash::{sha256, Hash};
use crate::transaction::{Address, TransactionId};

/// Fixed part of a block, hashed to produce the block checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block format version.
    pub version: u32,
    /// Block height, unique across the whole ledger.
    pub height: u64,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    /// Checksum of the previous block.
    pub previous_checksum: Hash,
}

/// One signer's signature over a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Signing address.
    pub signer: Address,
    /// Raw signature bytes; empty when only the compact encoding was stored.
    pub signature: Vec<u8>,
}

/// A ledger block with its derived metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// SHA-256 of the serialized header.
    pub checksum: Hash,
    /// Ids of the transactions applied in this block.
    pub transaction_ids: Vec<TransactionId>,
    /// Signature set.
    pub signatures: Vec<BlockSignature>,
    /// Frozen signature count at storage time.
    pub signature_count: u64,
    /// Sum of the signers' difficulty, arbitrary precision.
    pub total_signer_difficulty: BigUint,
    /// Proof-of-work field, if the block carries one.
    pub pow_field: Option<Vec<u8>>,
    /// Set when the block was assembled from local storage.
    pub from_local_storage: bool,
}

impl Block {
    /// Block height shorthand.
    #[inline]
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Serialized header bytes, the input to the block checksum.
    pub fn header_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(&self.header)
    }

    /// Serialized transaction-id list.
    pub fn transaction_ids_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(&self.transaction_ids)
    }

    /// Serialized signature set.
    ///
    /// The compact encoding keeps only the signer addresses; the full
    /// encoding keeps addresses and signature bytes.
    pub fn signature_bytes(&self, compact: bool) -> Result<Vec<u8>, CodecError> {
        if compact {
            let signers: Vec<&Address> = self.signatures.iter().map(|s| &s.signer).collect();
            codec::encode(&signers)
        } else {
            codec::encode(&self.signatures)
        }
    }

    /// Parses a stored header fragment.
    pub fn header_from_bytes(bytes: &[u8]) -> Result<BlockHeader, CodecError> {
        codec::decode(bytes)
    }

    /// Parses a stored transaction-id-list fragment.
    pub fn transaction_ids_from_bytes(bytes: &[u8]) -> Result<Vec<TransactionId>, CodecError> {
        codec::decode(bytes)
    }

    /// Parses a stored signature fragment in either encoding.
    pub fn signatures_from_bytes(
        bytes: &[u8],
        compact: bool,
    ) -> Result<Vec<BlockSignature>, CodecError> {
        if compact {
            let signers: Vec<Address> = codec::decode(bytes)?;
            Ok(signers
                .into_iter()
                .map(|signer| BlockSignature {
                    signer,
                    signature: Vec::new(),
                })
                .collect())
        } else {
            codec::decode(bytes)
        }
    }

    /// Recomputes the block checksum from the header.
    pub fn compute_checksum(&self) -> Result<Hash, CodecError> {
        Ok(sha256(&self.header_bytes()?))
    }
}
