//! Partitioned block and transaction storage.
//!
//! Block history is sharded into fixed-size partitions, each backed by its
//! own store that opens and closes independently. The [`StorageEngine`]
//! façade routes every operation to the partition covering the relevant
//! height, keeps at most a configured number of partitions open, and
//! compacts closed partitions in the background.
//!
//! # Architecture
//!
//! - [`keys`] builds the combined row keys shared by every table.
//! - [`tables`] defines the per-partition table set.
//! - [`partition`] implements one partition: atomic batches, record
//!   fragments, secondary indexes, and cascading removal.
//! - [`pool`] manages the partition lifecycle: lazy opening, LRU
//!   eviction, the retention window, and deferred compaction.
//! - [`writer`] serializes writes for backends without concurrent atomic
//!   batches.
//! - [`engine`] ties the pieces together behind one façade.

pub mod backend;
pub mod engine;
pub mod keys;
pub mod partition;
pub mod pool;
pub mod tables;
pub mod writer;

pub use backend::BackendKind;
pub use engine::{EngineError, StorageEngine};
pub use keys::{KeyError, KEY_PREFIX_LEN};
pub use partition::{Partition, PartitionError};
pub use pool::{PartitionPool, PoolError};
pub use tables::Tables;
pub use writer::{RetryPolicy, WriteQueue};
