//! Core types and primitives for the Strata ledger store.
//!
//! This crate provides the foundation shared by the storage layer and its
//! callers:
//! - Block and transaction data structures with byte-stable serialization
//! - Fixed-width identifier newtypes (addresses, transaction ids)
//! - Cryptographic hashing (SHA-256)
//! - Postcard codec helpers with consistent error handling
//! - Storage configuration with validated builders

pub mod block;
pub mod codec;
pub mod config;
pub mod hash;
pub mod transaction;

// Re-export commonly used types at crate root
pub use block::{Block, BlockHeader, BlockSignature};
pub use codec::{decode, encode, CodecError};
pub use config::{BackendChoice, ConfigError, StorageConfig};
pub use hash::{sha256, Hash, ZERO_HASH};
pub use transaction::{Address, Transaction, TransactionId, TxType, ADDRESS_LEN, TX_ID_LEN};
