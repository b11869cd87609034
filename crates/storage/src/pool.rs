//! Partition pool: lazy opening, LRU eviction, and deferred maintenance.
//!
//! The pool maps block heights to partitions and keeps at most
//! `max_open_partitions` stores open at a time. The partition holding the
//! highest known block and any partition still inside the retention window
//! are never evicted. Evicted and idle-closed partitions are queued for
//! deferred maintenance: on a later sweep they are reopened, compacted,
//! and closed again, unless they have come back into use in the meantime.
//!
//! Lock order is always pool, then partition. No partition lock is ever
//! held while acquiring the pool lock.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use num_bigint::BigUint;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use strata_types::{Address, Block, Hash, StorageConfig, Transaction, TransactionId, TxType};

use crate::backend::{BackendKind, STORE_FILE};
use crate::partition::{Partition, PartitionError};

/// Pool-level storage errors.
#[derive(Debug, Snafu)]
pub enum PoolError {
    /// A partition operation failed.
    #[snafu(display("{source}"))]
    Partition {
        /// Underlying partition error.
        source: PartitionError,
    },

    /// Free disk space fell below the configured floor.
    #[snafu(display(
        "Disk space too low to open partition: {available} bytes available, {required} required"
    ))]
    DiskSpaceLow {
        /// Bytes currently available.
        available: u64,
        /// Configured floor.
        required: u64,
    },

    /// A filesystem operation failed.
    #[snafu(display("Pool I/O error at {}: {source}", path.display()))]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

struct PoolInner {
    open: HashMap<u64, Arc<Mutex<Partition>>>,
    maintenance: VecDeque<Arc<Mutex<Partition>>>,
    // Outer None means the cache is invalid and must be rebuilt by a scan.
    cached_highest: Option<Option<u64>>,
    cached_lowest: Option<Option<u64>>,
}

/// Manages the set of partitions under one data directory.
pub struct PartitionPool {
    base: PathBuf,
    backend: BackendKind,
    config: StorageConfig,
    partition_cache_size: usize,
    inner: Mutex<PoolInner>,
}

impl PartitionPool {
    /// Creates a pool over `base`. No partition is opened until first use.
    pub fn new(base: &Path, backend: BackendKind, config: StorageConfig) -> Self {
        let partition_cache_size = config.cache_size_bytes / config.max_open_partitions;
        Self {
            base: base.to_path_buf(),
            backend,
            config,
            partition_cache_size,
            inner: Mutex::new(PoolInner {
                open: HashMap::new(),
                maintenance: VecDeque::new(),
                cached_highest: None,
                cached_lowest: None,
            }),
        }
    }

    /// Partition id covering a block height.
    pub fn partition_id_for(&self, height: u64) -> u64 {
        height / self.config.partition_size
    }

    /// Number of currently open partitions.
    pub fn open_partition_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .open
            .values()
            .filter(|arc| arc.lock().is_open())
            .count()
    }

    /// Stores a block in the partition covering its height.
    pub fn insert_block(&self, block: &Block) -> Result<(), PoolError> {
        let height = block.height();
        let mut inner = self.inner.lock();
        // Prime both caches so the bound updates below stay accurate.
        self.highest_locked(&mut inner)?;
        self.lowest_locked(&mut inner)?;

        let arc = self.open_partition_locked(&mut inner, self.partition_id_for(height))?;
        arc.lock().insert_block(block).context(PartitionSnafu)?;

        if let Some(cached) = &mut inner.cached_highest {
            *cached = Some(cached.map_or(height, |h| h.max(height)));
        }
        if let Some(cached) = &mut inner.cached_lowest {
            *cached = Some(cached.map_or(height, |h| h.min(height)));
        }
        Ok(())
    }

    /// Stores a transaction in the partition covering its applied height.
    pub fn insert_transaction(&self, tx: &Transaction) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let arc =
            self.open_partition_locked(&mut inner, self.partition_id_for(tx.applied_height))?;
        let mut partition = arc.lock();
        partition.insert_transaction(tx).context(PartitionSnafu)
    }

    /// Reads a block by height.
    pub fn get_block(&self, height: u64) -> Result<Option<Block>, PoolError> {
        self.with_existing(height, |partition| partition.get_block(height))
            .map(Option::flatten)
    }

    /// Reads a block's stored bytes by height.
    pub fn get_block_bytes(
        &self,
        height: u64,
        as_header: bool,
    ) -> Result<Option<Vec<u8>>, PoolError> {
        self.with_existing(height, |partition| partition.get_block_bytes(height, as_header))
            .map(Option::flatten)
    }

    /// Reads a block's checksum and total signer difficulty.
    pub fn get_block_total_signer_difficulty(
        &self,
        height: u64,
    ) -> Result<Option<(Hash, BigUint)>, PoolError> {
        self.with_existing(height, |partition| {
            partition.get_block_total_signer_difficulty(height)
        })
        .map(Option::flatten)
    }

    /// Reads a transaction from the partition covering `height`.
    pub fn get_transaction(
        &self,
        id: &TransactionId,
        height: u64,
    ) -> Result<Option<Transaction>, PoolError> {
        self.with_existing(height, |partition| partition.get_transaction(id))
            .map(Option::flatten)
    }

    /// Reads a transaction's stored bytes from the partition covering
    /// `height`.
    pub fn get_transaction_bytes(
        &self,
        id: &TransactionId,
        height: u64,
    ) -> Result<Option<Vec<u8>>, PoolError> {
        self.with_existing(height, |partition| partition.get_transaction_bytes(id))
            .map(Option::flatten)
    }

    /// Reads the transactions applied in one block.
    pub fn get_transactions_in_block(
        &self,
        height: u64,
        tx_type: Option<TxType>,
    ) -> Result<Vec<Transaction>, PoolError> {
        self.with_existing(height, |partition| {
            partition.get_transactions_in_block(height, tx_type)
        })
        .map(Option::unwrap_or_default)
    }

    /// Reads the stored bytes of the transactions applied in one block.
    pub fn get_transaction_bytes_in_block(
        &self,
        height: u64,
        tx_type: Option<TxType>,
    ) -> Result<Vec<Vec<u8>>, PoolError> {
        self.with_existing(height, |partition| {
            partition.get_transaction_bytes_in_block(height, tx_type)
        })
        .map(Option::unwrap_or_default)
    }

    /// Reads the transactions involving an address from the partition
    /// covering `partition_height`.
    pub fn get_transactions_by_address(
        &self,
        address: &Address,
        partition_height: u64,
        applied_height: Option<u64>,
    ) -> Result<Vec<Transaction>, PoolError> {
        self.with_existing(partition_height, |partition| {
            partition.get_transactions_by_address(address, applied_height)
        })
        .map(Option::unwrap_or_default)
    }

    /// Removes a block and its transactions. Invalidates the cached height
    /// bounds when a bound was removed.
    pub fn remove_block(&self, height: u64) -> Result<bool, PoolError> {
        let mut inner = self.inner.lock();
        let Some(arc) =
            self.existing_partition_locked(&mut inner, self.partition_id_for(height))?
        else {
            return Ok(false);
        };
        let removed = arc.lock().remove_block(height).context(PartitionSnafu)?;
        if removed {
            if inner.cached_highest == Some(Some(height)) {
                inner.cached_highest = None;
            }
            if inner.cached_lowest == Some(Some(height)) {
                inner.cached_lowest = None;
            }
        }
        Ok(removed)
    }

    /// Removes a transaction from the partition covering `height`.
    pub fn remove_transaction(
        &self,
        id: &TransactionId,
        height: u64,
    ) -> Result<bool, PoolError> {
        let mut inner = self.inner.lock();
        let Some(arc) =
            self.existing_partition_locked(&mut inner, self.partition_id_for(height))?
        else {
            return Ok(false);
        };
        let mut partition = arc.lock();
        partition.remove_transaction(id).context(PartitionSnafu)
    }

    /// Highest block height present in storage, scanning partitions from
    /// the top when the cached value has been invalidated.
    pub fn highest_block_in_storage(&self) -> Result<Option<u64>, PoolError> {
        let mut inner = self.inner.lock();
        self.highest_locked(&mut inner)
    }

    /// Lowest block height present in storage.
    pub fn lowest_block_in_storage(&self) -> Result<Option<u64>, PoolError> {
        let mut inner = self.inner.lock();
        self.lowest_locked(&mut inner)
    }

    /// One background maintenance pass: close idle partitions, drain the
    /// deferred-maintenance queue, and shed everything if disk space has
    /// fallen below the floor. No-op for the in-memory backend.
    pub fn sweep(&self) {
        if self.backend == BackendKind::Memory {
            return;
        }
        let mut inner = self.inner.lock();

        if let Some(available) = self.available_disk_space() {
            if available < self.config.min_free_disk_bytes {
                warn!(
                    available,
                    required = self.config.min_free_disk_bytes,
                    "free disk space below floor, closing all partitions"
                );
                self.close_all_locked(&mut inner);
                return;
            }
        }

        let highest = match self.highest_locked(&mut inner) {
            Ok(highest) => highest,
            Err(error) => {
                warn!(%error, "maintenance sweep could not determine highest block");
                None
            }
        };
        let hot_id = highest.map(|h| self.partition_id_for(h));

        self.close_idle_locked(&mut inner, hot_id, highest);
        self.drain_maintenance_locked(&mut inner, highest);
    }

    /// Compacts every partition present on disk. Intended for startup,
    /// before the engine begins serving.
    pub fn optimize_all(&self) -> Result<(), PoolError> {
        if self.backend == BackendKind::Memory {
            return Ok(());
        }
        let ids = self.partition_ids_on_disk()?;
        info!(partitions = ids.len(), "compacting all partitions");
        for id in ids {
            let mut partition =
                Partition::new(id, &self.base, self.backend, self.partition_cache_size);
            if let Err(error) = partition.open() {
                warn!(partition = id, %error, "skipping unopenable partition during optimize");
                continue;
            }
            partition.compact();
            partition.close();
        }
        Ok(())
    }

    /// Closes every partition and deletes the data directory.
    pub fn delete_data(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        self.close_all_locked(&mut inner);
        inner.maintenance.clear();
        inner.open.clear();
        inner.cached_highest = Some(None);
        inner.cached_lowest = Some(None);
        if self.backend == BackendKind::File {
            match std::fs::remove_dir_all(&self.base) {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PoolError::Io {
                        path: self.base.clone(),
                        source,
                    })
                }
            }
        }
        info!(path = %self.base.display(), "deleted all partition data");
        Ok(())
    }

    /// Drains the maintenance queue synchronously and closes every open
    /// partition. Called once at engine shutdown.
    pub fn shutdown_all(&self) {
        let mut inner = self.inner.lock();
        while let Some(arc) = inner.maintenance.pop_front() {
            let mut partition = arc.lock();
            if inner.open.contains_key(&partition.id()) {
                continue;
            }
            match partition.open() {
                Ok(()) => {
                    partition.compact();
                    partition.close();
                }
                Err(error) => {
                    warn!(partition = partition.id(), %error, "maintenance skipped at shutdown");
                }
            }
        }
        self.close_all_locked(&mut inner);
        inner.open.clear();
        debug!("all partitions closed");
    }

    /// Runs `op` on the partition covering `height`, if one exists.
    fn with_existing<T>(
        &self,
        height: u64,
        op: impl FnOnce(&mut Partition) -> Result<T, PartitionError>,
    ) -> Result<Option<T>, PoolError> {
        let mut inner = self.inner.lock();
        let Some(arc) =
            self.existing_partition_locked(&mut inner, self.partition_id_for(height))?
        else {
            return Ok(None);
        };
        let mut partition = arc.lock();
        op(&mut partition).context(PartitionSnafu).map(Some)
    }

    /// Returns the partition with the given id only if it already holds
    /// data: a mapped entry, or a store file on disk for the file backend.
    fn existing_partition_locked(
        &self,
        inner: &mut PoolInner,
        id: u64,
    ) -> Result<Option<Arc<Mutex<Partition>>>, PoolError> {
        if inner.open.contains_key(&id) {
            return self.open_partition_locked(inner, id).map(Some);
        }
        match self.backend {
            // In-memory partitions exist only while mapped.
            BackendKind::Memory => Ok(None),
            BackendKind::File => {
                if self.base.join(id.to_string()).join(STORE_FILE).is_file() {
                    self.open_partition_locked(inner, id).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Returns the partition with the given id, opening or creating it as
    /// needed, subject to the free-disk-space floor.
    fn open_partition_locked(
        &self,
        inner: &mut PoolInner,
        id: u64,
    ) -> Result<Arc<Mutex<Partition>>, PoolError> {
        if let Some(arc) = inner.open.get(&id) {
            let arc = Arc::clone(arc);
            let mut partition = arc.lock();
            // Reopening a mapped-but-closed partition hits disk the same
            // way a fresh open does, so the floor applies here too.
            if !partition.is_open() {
                self.check_disk_space()?;
                partition.open().context(PartitionSnafu)?;
            }
            drop(partition);
            return Ok(arc);
        }

        self.check_disk_space()?;

        let mut partition =
            Partition::new(id, &self.base, self.backend, self.partition_cache_size);
        partition.open().context(PartitionSnafu)?;
        let arc = Arc::new(Mutex::new(partition));
        inner.open.insert(id, Arc::clone(&arc));
        debug!(partition = id, open = inner.open.len(), "opened partition");

        self.evict_locked(inner);
        Ok(arc)
    }

    /// Evicts least-recently-used partitions until the open count fits the
    /// configured limit. The hot partition, partitions inside the
    /// retention window, and partitions currently in use are never
    /// evicted.
    fn evict_locked(&self, inner: &mut PoolInner) {
        let highest = inner.cached_highest.flatten();
        let hot_id = highest.map(|h| self.partition_id_for(h));

        while inner.open.len() > self.config.max_open_partitions {
            let mut candidate: Option<(u64, Instant)> = None;
            for (id, arc) in &inner.open {
                if Some(*id) == hot_id || Arc::strong_count(arc) > 1 {
                    continue;
                }
                let Some(partition) = arc.try_lock() else {
                    continue;
                };
                if in_retention(partition.max_block(), highest, self.config.retention_window) {
                    continue;
                }
                let last_used = partition.last_used();
                if candidate.is_none_or(|(_, t)| last_used < t) {
                    candidate = Some((*id, last_used));
                }
            }
            let Some((id, _)) = candidate else {
                break;
            };
            if let Some(arc) = inner.open.remove(&id) {
                arc.lock().close();
                debug!(partition = id, "evicted partition");
                inner.maintenance.push_back(arc);
            }
        }
    }

    /// Closes partitions that have been idle past the configured timeout
    /// and queues them for deferred compaction.
    fn close_idle_locked(
        &self,
        inner: &mut PoolInner,
        hot_id: Option<u64>,
        highest: Option<u64>,
    ) {
        let idle = self.config.idle_close();
        let mut to_close = Vec::new();
        for (id, arc) in &inner.open {
            if Some(*id) == hot_id || Arc::strong_count(arc) > 1 {
                continue;
            }
            let Some(partition) = arc.try_lock() else {
                continue;
            };
            if !partition.is_open() {
                continue;
            }
            if in_retention(partition.max_block(), highest, self.config.retention_window) {
                continue;
            }
            if partition.last_used().elapsed() >= idle {
                to_close.push(*id);
            }
        }
        for id in to_close {
            if let Some(arc) = inner.open.remove(&id) {
                arc.lock().close();
                debug!(partition = id, "closed idle partition");
                inner.maintenance.push_back(arc);
            }
        }
    }

    /// Processes the deferred-maintenance queue: each queued partition is
    /// reopened, compacted, and closed. A partition that has come back
    /// into use is skipped and requeued; one still inside the retention
    /// window is requeued without compacting.
    fn drain_maintenance_locked(&self, inner: &mut PoolInner, highest: Option<u64>) {
        for _ in 0..inner.maintenance.len() {
            let Some(arc) = inner.maintenance.pop_front() else {
                break;
            };
            let Some(mut partition) = arc.try_lock() else {
                inner.maintenance.push_back(Arc::clone(&arc));
                continue;
            };
            if inner.open.contains_key(&partition.id()) {
                drop(partition);
                inner.maintenance.push_back(arc);
                continue;
            }
            if in_retention(partition.max_block(), highest, self.config.retention_window) {
                drop(partition);
                inner.maintenance.push_back(arc);
                continue;
            }
            match partition.open() {
                Ok(()) => {
                    partition.compact();
                    partition.close();
                }
                Err(error) => {
                    warn!(partition = partition.id(), %error, "deferred maintenance failed, requeued");
                    drop(partition);
                    inner.maintenance.push_back(arc);
                }
            }
        }
    }

    fn close_all_locked(&self, inner: &mut PoolInner) {
        for arc in inner.open.values() {
            arc.lock().close();
        }
    }

    fn highest_locked(&self, inner: &mut PoolInner) -> Result<Option<u64>, PoolError> {
        if let Some(cached) = inner.cached_highest {
            return Ok(cached);
        }
        let mut ids = self.partition_ids(inner)?;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in ids {
            let Some(arc) = self.existing_partition_locked(inner, id)? else {
                continue;
            };
            let max = arc.lock().max_block();
            if let Some(max) = max {
                inner.cached_highest = Some(Some(max));
                return Ok(Some(max));
            }
        }
        inner.cached_highest = Some(None);
        Ok(None)
    }

    fn lowest_locked(&self, inner: &mut PoolInner) -> Result<Option<u64>, PoolError> {
        if let Some(cached) = inner.cached_lowest {
            return Ok(cached);
        }
        let mut ids = self.partition_ids(inner)?;
        ids.sort_unstable();
        for id in ids {
            let Some(arc) = self.existing_partition_locked(inner, id)? else {
                continue;
            };
            let min = arc.lock().min_block();
            if let Some(min) = min {
                inner.cached_lowest = Some(Some(min));
                return Ok(Some(min));
            }
        }
        inner.cached_lowest = Some(None);
        Ok(None)
    }

    /// Every partition id that could hold data: mapped ids for the
    /// in-memory backend, directory names for the file backend.
    fn partition_ids(&self, inner: &PoolInner) -> Result<Vec<u64>, PoolError> {
        match self.backend {
            BackendKind::Memory => Ok(inner.open.keys().copied().collect()),
            BackendKind::File => self.partition_ids_on_disk(),
        }
    }

    fn partition_ids_on_disk(&self) -> Result<Vec<u64>, PoolError> {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PoolError::Io {
                    path: self.base.clone(),
                    source,
                })
            }
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PoolError::Io {
                path: self.base.clone(),
                source,
            })?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Refuses to open another partition when free disk space is below
    /// the configured floor. A probe failure is logged and allowed.
    fn check_disk_space(&self) -> Result<(), PoolError> {
        if self.backend == BackendKind::Memory {
            return Ok(());
        }
        let Some(available) = self.available_disk_space() else {
            return Ok(());
        };
        if available < self.config.min_free_disk_bytes {
            return Err(PoolError::DiskSpaceLow {
                available,
                required: self.config.min_free_disk_bytes,
            });
        }
        Ok(())
    }

    fn available_disk_space(&self) -> Option<u64> {
        if self.backend == BackendKind::Memory {
            return None;
        }
        match fs2::available_space(&self.base) {
            Ok(available) => Some(available),
            Err(error) => {
                warn!(path = %self.base.display(), %error, "could not probe free disk space");
                None
            }
        }
    }
}

/// Whether a partition's highest block is within the retention window of
/// the overall highest block.
fn in_retention(partition_max: Option<u64>, highest: Option<u64>, retention: u64) -> bool {
    match (partition_max, highest) {
        (Some(max), Some(highest)) => max.saturating_add(retention) >= highest,
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use strata_types::{sha256, BlockHeader, TxType, ZERO_HASH};

    use super::*;

    fn test_config(partition_size: u64, max_open: usize) -> StorageConfig {
        StorageConfig::builder()
            .partition_size(partition_size)
            .max_open_partitions(max_open)
            .retention_window(partition_size)
            .cache_size_bytes(8 * 1024 * 1024)
            .min_free_disk_bytes(0)
            .idle_close_secs(3600)
            .build()
            .expect("valid test config")
    }

    fn file_pool(base: &Path, partition_size: u64, max_open: usize) -> PartitionPool {
        PartitionPool::new(base, BackendKind::File, test_config(partition_size, max_open))
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

    fn test_transaction(applied_height: u64, seed: u8) -> Transaction {
        let mut senders = BTreeMap::new();
        senders.insert(Address::new([seed; 33]), 100u128);
        let mut tx = Transaction {
            id: TransactionId::from_parts(applied_height, &sha256(&[seed])),
            tx_type: TxType::Normal,
            applied_height,
            senders,
            receivers: BTreeMap::new(),
            checksum: ZERO_HASH,
            from_local_storage: false,
        };
        tx.checksum = tx.compute_checksum().expect("checksum");
        tx
    }

    #[test]
    fn test_missing_partition_resolves_to_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(dir.path(), 10, 4);
        assert_eq!(pool.get_block(5).expect("get"), None);
        assert_eq!(pool.open_partition_count(), 0);
    }

    #[test]
    fn test_disk_floor_refuses_partition_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(10, 4);
        config.min_free_disk_bytes = u64::MAX;
        let pool = PartitionPool::new(dir.path(), BackendKind::File, config);

        assert!(matches!(
            pool.insert_block(&test_block(5)),
            Err(PoolError::DiskSpaceLow { .. })
        ));
    }

    #[test]
    fn test_insert_and_read_across_partitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(dir.path(), 10, 4);
        pool.insert_block(&test_block(5)).expect("insert");
        pool.insert_block(&test_block(25)).expect("insert");

        assert!(pool.get_block(5).expect("get").is_some());
        assert!(pool.get_block(25).expect("get").is_some());
        assert_eq!(pool.get_block(15).expect("get"), None);
        assert_eq!(pool.open_partition_count(), 2);
    }

    #[test]
    fn test_bounds_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let pool = file_pool(dir.path(), 100, 4);
            for height in [500, 250, 750] {
                pool.insert_block(&test_block(height)).expect("insert");
            }
            assert_eq!(pool.highest_block_in_storage().expect("highest"), Some(750));
            assert_eq!(pool.lowest_block_in_storage().expect("lowest"), Some(250));
        }
        let pool = file_pool(dir.path(), 100, 4);
        assert_eq!(pool.highest_block_in_storage().expect("highest"), Some(750));
        assert_eq!(pool.lowest_block_in_storage().expect("lowest"), Some(250));
    }

    #[test]
    fn test_eviction_keeps_hot_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(dir.path(), 10, 2);
        // Partition 50 holds the highest block and stays open; the oldest
        // cold partition is evicted when the limit is exceeded.
        pool.insert_block(&test_block(500)).expect("insert");
        pool.insert_block(&test_block(100)).expect("insert");
        pool.insert_block(&test_block(200)).expect("insert");

        assert!(pool.open_partition_count() <= 2);
        assert!(pool.get_block(500).expect("get").is_some());
        // Evicted partitions reopen transparently.
        assert!(pool.get_block(100).expect("get").is_some());
    }

    #[test]
    fn test_sweep_closes_idle_partitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(10, 4);
        config.idle_close_secs = 0;
        let pool = PartitionPool::new(dir.path(), BackendKind::File, config);

        pool.insert_block(&test_block(500)).expect("insert");
        pool.insert_block(&test_block(100)).expect("insert");
        assert_eq!(pool.open_partition_count(), 2);

        pool.sweep();
        // The hot partition survives, the idle one is closed.
        assert_eq!(pool.open_partition_count(), 1);
        assert!(pool.get_block(100).expect("reopen").is_some());
    }

    #[test]
    fn test_remove_block_invalidates_highest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(dir.path(), 100, 4);
        pool.insert_block(&test_block(500)).expect("insert");
        pool.insert_block(&test_block(750)).expect("insert");
        assert_eq!(pool.highest_block_in_storage().expect("highest"), Some(750));

        assert!(pool.remove_block(750).expect("remove"));
        assert_eq!(pool.highest_block_in_storage().expect("highest"), Some(500));
        assert!(!pool.remove_block(750).expect("second remove"));
    }

    #[test]
    fn test_transactions_round_trip_through_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = file_pool(dir.path(), 10, 4);
        let tx = test_transaction(7, 3);
        pool.insert_transaction(&tx).expect("insert");

        let stored = pool
            .get_transaction(&tx.id, 7)
            .expect("get")
            .expect("present");
        assert_eq!(stored.id, tx.id);

        let by_addr = pool
            .get_transactions_by_address(&Address::new([3; 33]), 7, None)
            .expect("scan");
        assert_eq!(by_addr.len(), 1);

        assert!(pool.remove_transaction(&tx.id, 7).expect("remove"));
        assert_eq!(pool.get_transaction(&tx.id, 7).expect("get"), None);
    }

    #[test]
    fn test_delete_data_removes_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("data");
        let pool = file_pool(&base, 10, 4);
        pool.insert_block(&test_block(5)).expect("insert");
        assert!(base.exists());

        pool.delete_data().expect("delete");
        assert!(!base.exists());
        assert_eq!(pool.highest_block_in_storage().expect("highest"), None);
    }

    #[test]
    fn test_memory_pool_keeps_data_across_sweeps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = PartitionPool::new(dir.path(), BackendKind::Memory, test_config(10, 2));
        pool.insert_block(&test_block(5)).expect("insert");
        pool.sweep();
        assert!(pool.get_block(5).expect("get").is_some());
    }
}
