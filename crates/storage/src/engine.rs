//! Storage engine façade.
//!
//! Owns the partition pool, the background maintenance thread, and, for
//! backends without concurrent atomic writes, the serializing write
//! queue. All block and transaction operations go through this type.
//!
//! Transaction lookups take a height hint. A non-zero hint names the
//! exact block the transaction was applied in; a zero hint falls back to
//! the generation height encoded in the transaction id and probes forward
//! partition by partition, bounded by the retention window.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use num_bigint::BigUint;
use snafu::{ResultExt, Snafu};
use tracing::{error, info, warn};

use strata_types::{
    Address, Block, ConfigError, Hash, StorageConfig, Transaction, TransactionId, TxType,
};

use crate::backend::{self, BackendKind};
use crate::pool::{PartitionPool, PoolError};
use crate::writer::{RetryPolicy, WriteQueue};

const MAINTENANCE_TICK: Duration = Duration::from_millis(50);

/// Engine-level storage errors.
#[derive(Debug, Snafu)]
pub enum EngineError {
    /// A pool or partition operation failed.
    #[snafu(display("{source}"))]
    Pool {
        /// Underlying pool error.
        source: PoolError,
    },

    /// The configuration failed validation.
    #[snafu(display("{source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },

    /// The engine has been shut down, or the write queue exhausted its
    /// retry budget and halted.
    #[snafu(display("Storage engine is halted"))]
    Halted,

    /// A filesystem operation failed.
    #[snafu(display("Engine I/O error at {}: {source}", path.display()))]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A background thread could not be spawned.
    #[snafu(display("Failed to spawn storage thread: {source}"))]
    Thread {
        /// Underlying spawn error.
        source: std::io::Error,
    },
}

/// Partitioned block and transaction storage.
pub struct StorageEngine {
    config: StorageConfig,
    backend: BackendKind,
    pool: Arc<PartitionPool>,
    writer: Option<WriteQueue>,
    maintenance: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl StorageEngine {
    /// Opens the engine over a data directory.
    ///
    /// Resolves the backend, optionally compacts every partition on disk,
    /// and starts the background maintenance thread. Backends without
    /// concurrent atomic writes additionally get a serializing write
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the data
    /// directory cannot be created, or a background thread fails to
    /// spawn.
    pub fn open(base: &Path, config: StorageConfig) -> Result<Self, EngineError> {
        config.validate().context(ConfigSnafu)?;
        let backend = backend::resolve(config.backend, base);
        if backend == BackendKind::File {
            std::fs::create_dir_all(base).context(IoSnafu {
                path: base.to_path_buf(),
            })?;
        }

        let pool = Arc::new(PartitionPool::new(base, backend, config.clone()));
        if config.optimize_storage {
            pool.optimize_all().context(PoolSnafu)?;
        }
        let highest = pool.highest_block_in_storage().context(PoolSnafu)?;
        info!(
            path = %base.display(),
            ?backend,
            highest_block = highest,
            "storage engine opened"
        );

        let running = Arc::new(AtomicBool::new(true));
        let maintenance = {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let interval = config.sweep_interval();
            std::thread::Builder::new()
                .name("storage-maintenance".to_string())
                .spawn(move || {
                    let mut last_sweep = Instant::now();
                    while running.load(Ordering::Acquire) {
                        std::thread::sleep(MAINTENANCE_TICK);
                        if last_sweep.elapsed() >= interval {
                            pool.sweep();
                            last_sweep = Instant::now();
                        }
                    }
                })
                .context(ThreadSnafu)?
        };

        let writer = if backend.supports_concurrent_atomic_writes() {
            None
        } else {
            Some(
                WriteQueue::start(Arc::clone(&pool), RetryPolicy::default())
                    .context(ThreadSnafu)?,
            )
        };

        Ok(Self {
            config,
            backend,
            pool,
            writer,
            maintenance: Some(maintenance),
            running,
        })
    }

    /// The backend this engine resolved at open time.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Stores a block, through the write queue when one is present.
    pub fn insert_block(&self, block: Block) -> Result<(), EngineError> {
        self.ensure_running()?;
        match &self.writer {
            Some(writer) => {
                if writer.enqueue_block(block) {
                    Ok(())
                } else {
                    Err(EngineError::Halted)
                }
            }
            None => self.pool.insert_block(&block).context(PoolSnafu),
        }
    }

    /// Stores a transaction, through the write queue when one is present.
    pub fn insert_transaction(&self, tx: Transaction) -> Result<(), EngineError> {
        self.ensure_running()?;
        match &self.writer {
            Some(writer) => {
                if writer.enqueue_transaction(tx) {
                    Ok(())
                } else {
                    Err(EngineError::Halted)
                }
            }
            None => self.pool.insert_transaction(&tx).context(PoolSnafu),
        }
    }

    /// Reads a block by height.
    pub fn get_block(&self, height: u64) -> Result<Option<Block>, EngineError> {
        self.ensure_running()?;
        if self.above_highest(height)? {
            return Ok(None);
        }
        self.pool.get_block(height).context(PoolSnafu)
    }

    /// Reads a block's stored bytes: header plus compact signers in
    /// header mode, otherwise header, full signatures, and transaction
    /// ids.
    pub fn get_block_bytes(
        &self,
        height: u64,
        as_header: bool,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        self.ensure_running()?;
        if self.above_highest(height)? {
            return Ok(None);
        }
        self.pool
            .get_block_bytes(height, as_header)
            .context(PoolSnafu)
    }

    /// Reads a block's checksum and total signer difficulty.
    pub fn get_block_total_signer_difficulty(
        &self,
        height: u64,
    ) -> Result<Option<(Hash, BigUint)>, EngineError> {
        self.ensure_running()?;
        self.pool
            .get_block_total_signer_difficulty(height)
            .context(PoolSnafu)
    }

    /// Reads a transaction by id.
    ///
    /// With a non-zero `height_hint` the lookup goes straight to the
    /// partition covering that height, and a transaction found there must
    /// have been applied exactly at the hinted height. With a zero hint
    /// the search starts at the generation height encoded in the id and
    /// probes forward partition by partition, bounded by the retention
    /// window and the highest stored block.
    pub fn get_transaction(
        &self,
        id: &TransactionId,
        height_hint: u64,
    ) -> Result<Option<Transaction>, EngineError> {
        self.ensure_running()?;
        if height_hint != 0 {
            return Ok(self
                .pool
                .get_transaction(id, height_hint)
                .context(PoolSnafu)?
                .filter(|tx| tx.applied_height == height_hint));
        }
        let Some(probe) = self.probe_heights(id)? else {
            return Ok(None);
        };
        for height in probe {
            if let Some(tx) = self.pool.get_transaction(id, height).context(PoolSnafu)? {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Reads a transaction's stored bytes by id, with the same hint
    /// semantics as [`Self::get_transaction`].
    pub fn get_transaction_bytes(
        &self,
        id: &TransactionId,
        height_hint: u64,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        self.ensure_running()?;
        if height_hint != 0 {
            // Same applied-height check as the decoded lookup: a hit in the
            // hinted partition with a different applied height is not-found.
            let verified = self
                .pool
                .get_transaction(id, height_hint)
                .context(PoolSnafu)?
                .is_some_and(|tx| tx.applied_height == height_hint);
            if !verified {
                return Ok(None);
            }
            return self
                .pool
                .get_transaction_bytes(id, height_hint)
                .context(PoolSnafu);
        }
        let Some(probe) = self.probe_heights(id)? else {
            return Ok(None);
        };
        for height in probe {
            let bytes = self
                .pool
                .get_transaction_bytes(id, height)
                .context(PoolSnafu)?;
            if bytes.is_some() {
                return Ok(bytes);
            }
        }
        Ok(None)
    }

    /// Reads the transactions applied in one block, optionally filtered
    /// by type. An absent block yields an empty list.
    pub fn get_transactions_in_block(
        &self,
        height: u64,
        tx_type: Option<TxType>,
    ) -> Result<Vec<Transaction>, EngineError> {
        self.ensure_running()?;
        self.pool
            .get_transactions_in_block(height, tx_type)
            .context(PoolSnafu)
    }

    /// Reads the stored bytes of the transactions applied in one block.
    pub fn get_transaction_bytes_in_block(
        &self,
        height: u64,
        tx_type: Option<TxType>,
    ) -> Result<Vec<Vec<u8>>, EngineError> {
        self.ensure_running()?;
        self.pool
            .get_transaction_bytes_in_block(height, tx_type)
            .context(PoolSnafu)
    }

    /// Reads the transactions involving an address from the partition
    /// covering `partition_height`, optionally restricted to one applied
    /// height.
    pub fn get_transactions_by_address(
        &self,
        address: &Address,
        partition_height: u64,
        applied_height: Option<u64>,
    ) -> Result<Vec<Transaction>, EngineError> {
        self.ensure_running()?;
        self.pool
            .get_transactions_by_address(address, partition_height, applied_height)
            .context(PoolSnafu)
    }

    /// Removes a block and the transactions applied in it.
    pub fn remove_block(&self, height: u64) -> Result<bool, EngineError> {
        self.ensure_running()?;
        self.pool.remove_block(height).context(PoolSnafu)
    }

    /// Removes a transaction from the partition covering `height`.
    pub fn remove_transaction(
        &self,
        id: &TransactionId,
        height: u64,
    ) -> Result<bool, EngineError> {
        self.ensure_running()?;
        self.pool.remove_transaction(id, height).context(PoolSnafu)
    }

    /// Highest block height present in storage.
    pub fn get_highest_block_in_storage(&self) -> Result<Option<u64>, EngineError> {
        self.ensure_running()?;
        self.pool.highest_block_in_storage().context(PoolSnafu)
    }

    /// Lowest block height present in storage.
    pub fn get_lowest_block_in_storage(&self) -> Result<Option<u64>, EngineError> {
        self.ensure_running()?;
        self.pool.lowest_block_in_storage().context(PoolSnafu)
    }

    /// Removes every block below `cutoff_height` on a node that does not
    /// keep full history. Returns false, removing nothing, when full
    /// history is configured.
    pub fn redact_block_storage(&self, cutoff_height: u64) -> Result<bool, EngineError> {
        self.ensure_running()?;
        if self.config.store_full_history {
            info!("redaction refused: node stores full history");
            return Ok(false);
        }
        let Some(lowest) = self.pool.lowest_block_in_storage().context(PoolSnafu)? else {
            return Ok(false);
        };
        let mut removed = 0u64;
        for height in lowest..cutoff_height {
            if self.pool.remove_block(height).context(PoolSnafu)? {
                removed += 1;
            }
        }
        info!(cutoff_height, removed, "redacted block storage");
        Ok(true)
    }

    /// Number of writes waiting in the queue. Zero for backends that
    /// write directly.
    pub fn queued_write_count(&self) -> usize {
        self.writer.as_ref().map_or(0, WriteQueue::len)
    }

    /// Blocks until every previously enqueued write has been applied.
    pub fn flush_writes(&self) -> Result<(), EngineError> {
        self.ensure_running()?;
        match &self.writer {
            Some(writer) if !writer.flush() => Err(EngineError::Halted),
            _ => Ok(()),
        }
    }

    /// Deletes all stored data. The engine stays open and empty.
    pub fn delete_data(&self) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.flush_writes()?;
        self.pool.delete_data().context(PoolSnafu)
    }

    /// Shuts the engine down: stops the maintenance thread, drains the
    /// write queue in order, and closes every partition. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(maintenance) = self.maintenance.take() {
            if maintenance.join().is_err() {
                error!("maintenance thread panicked during shutdown");
            }
        }
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown();
        }
        self.pool.shutdown_all();
        info!("storage engine shut down");
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::Halted);
        }
        if self.writer.as_ref().is_some_and(WriteQueue::is_halted) {
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    /// Whether a height lies above everything in storage. Reads above the
    /// highest stored block are answered without opening partitions.
    fn above_highest(&self, height: u64) -> Result<bool, EngineError> {
        let highest = self.pool.highest_block_in_storage().context(PoolSnafu)?;
        let above = highest.is_none_or(|h| height > h);
        if above {
            warn!(height, highest_block = highest, "read above highest stored block");
        }
        Ok(above)
    }

    /// Heights to probe for a transaction with no height hint, one per
    /// partition, starting at the generation height encoded in the id.
    fn probe_heights(
        &self,
        id: &TransactionId,
    ) -> Result<Option<impl Iterator<Item = u64>>, EngineError> {
        let generation = id.generation_height();
        if generation == 0 {
            error!(id = %id, "transaction id carries no generation height");
            return Ok(None);
        }
        let Some(highest) = self.pool.highest_block_in_storage().context(PoolSnafu)? else {
            return Ok(None);
        };
        let bound = highest.min(generation.saturating_add(self.config.retention_window));
        if bound < generation {
            return Ok(None);
        }
        // One probe height per partition covering [generation, bound].
        let size = self.config.partition_size;
        let first = generation / size;
        let last = bound / size;
        Ok(Some((first..=last).map(move |id| id * size)))
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use strata_types::{sha256, BackendChoice, BlockHeader, ZERO_HASH};

    use super::*;

    fn test_config(backend: BackendChoice) -> StorageConfig {
        StorageConfig::builder()
            .partition_size(10)
            .max_open_partitions(4)
            .retention_window(100)
            .cache_size_bytes(8 * 1024 * 1024)
            .min_free_disk_bytes(0)
            .backend(backend)
            .build()
            .expect("valid test config")
    }

    fn test_block(height: u64) -> Block {
        let header = BlockHeader {
            version: 1,
            height,
            timestamp: 1_700_000_000 + height,
            previous_checksum: ZERO_HASH,
        };
        let mut block = Block {
            checksum: ZERO_HASH,
            header,
            transaction_ids: Vec::new(),
            signatures: Vec::new(),
            signature_count: 0,
            total_signer_difficulty: BigUint::from(height),
            pow_field: None,
            from_local_storage: false,
        };
        block.checksum = block.compute_checksum().expect("checksum");
        block
    }

    fn test_transaction(applied_height: u64, generation_height: u64, seed: u8) -> Transaction {
        let mut tx = Transaction {
            id: TransactionId::from_parts(generation_height, &sha256(&[seed])),
            tx_type: TxType::Normal,
            applied_height,
            senders: BTreeMap::from([(Address::new([seed; 33]), 100u128)]),
            receivers: BTreeMap::new(),
            checksum: ZERO_HASH,
            from_local_storage: false,
        };
        tx.checksum = tx.compute_checksum().expect("checksum");
        tx
    }

    #[test]
    fn test_file_engine_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        assert_eq!(engine.backend(), BackendKind::File);
        assert_eq!(engine.queued_write_count(), 0);

        engine.insert_block(test_block(7)).expect("insert");
        let stored = engine.get_block(7).expect("get").expect("present");
        assert_eq!(stored.height(), 7);
        assert_eq!(engine.get_highest_block_in_storage().expect("highest"), Some(7));
        assert_eq!(engine.get_block(8).expect("get above highest"), None);
    }

    #[test]
    fn test_open_fails_over_corrupt_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store_dir = dir.path().join("0");
        std::fs::create_dir_all(&store_dir).expect("create partition dir");
        std::fs::write(store_dir.join(crate::backend::STORE_FILE), vec![0x5a; 4096])
            .expect("write garbage");

        // The startup height scan must surface the corrupt store instead
        // of treating it as an empty partition.
        assert!(StorageEngine::open(dir.path(), test_config(BackendChoice::File)).is_err());
    }

    #[test]
    fn test_memory_engine_writes_go_through_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::Memory)).expect("open");
        assert_eq!(engine.backend(), BackendKind::Memory);

        engine.insert_block(test_block(3)).expect("enqueue");
        engine.flush_writes().expect("flush");
        assert!(engine.get_block(3).expect("get").is_some());
    }

    #[test]
    fn test_transaction_hint_must_match_applied_height() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        let tx = test_transaction(7, 6, 1);
        engine.insert_transaction(tx.clone()).expect("insert");

        assert!(engine.get_transaction(&tx.id, 7).expect("get").is_some());
        // Same partition, wrong applied height.
        assert_eq!(engine.get_transaction(&tx.id, 8).expect("get"), None);
    }

    #[test]
    fn test_transaction_lookup_without_hint_probes_forward() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        // Generated at height 6, applied at 25: two partitions later.
        let tx = test_transaction(25, 6, 1);
        engine.insert_block(test_block(30)).expect("insert block");
        engine.insert_transaction(tx.clone()).expect("insert tx");

        let found = engine.get_transaction(&tx.id, 0).expect("probe");
        assert_eq!(found.expect("present").id, tx.id);
    }

    #[test]
    fn test_transaction_lookup_rejects_zero_generation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        engine.insert_block(test_block(5)).expect("insert");

        let id = TransactionId::from_parts(0, &sha256(b"nohint"));
        assert_eq!(engine.get_transaction(&id, 0).expect("get"), None);
    }

    #[test]
    fn test_redaction_refused_with_full_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        engine.insert_block(test_block(1)).expect("insert");
        assert!(!engine.redact_block_storage(2).expect("redact"));
        assert!(engine.get_block(1).expect("get").is_some());
    }

    #[test]
    fn test_redaction_removes_blocks_below_cutoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(BackendChoice::File);
        config.store_full_history = false;
        let engine = StorageEngine::open(dir.path(), config).expect("open");
        for height in 0..6 {
            engine.insert_block(test_block(height)).expect("insert");
        }

        assert!(engine.redact_block_storage(3).expect("redact"));
        assert_eq!(engine.get_block(2).expect("get"), None);
        assert!(engine.get_block(3).expect("get").is_some());
        assert_eq!(engine.get_lowest_block_in_storage().expect("lowest"), Some(3));
    }

    #[test]
    fn test_shutdown_halts_operations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        engine.insert_block(test_block(1)).expect("insert");
        engine.shutdown();
        assert!(matches!(engine.get_block(1), Err(EngineError::Halted)));
        // Second shutdown is a no-op.
        engine.shutdown();
    }

    #[test]
    fn test_delete_data_leaves_engine_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine =
            StorageEngine::open(dir.path(), test_config(BackendChoice::File)).expect("open");
        engine.insert_block(test_block(1)).expect("insert");
        engine.delete_data().expect("delete");
        assert_eq!(engine.get_highest_block_in_storage().expect("highest"), None);
        engine.insert_block(test_block(2)).expect("insert after delete");
        assert!(engine.get_block(2).expect("get").is_some());
    }
}
