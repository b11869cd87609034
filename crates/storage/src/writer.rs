//! Serializing write queue.
//!
//! Backends that cannot accept atomic write batches from multiple threads
//! are fronted by a single worker thread. Callers enqueue blocks and
//! transactions; the worker applies them in FIFO order. A failing write is
//! retried a bounded number of times with a full forensic dump of the item
//! on every attempt, and exhausting the retry budget halts the queue: the
//! engine refuses further operations rather than silently dropping writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info};

use strata_types::{Block, Transaction};

use crate::pool::PartitionPool;

/// Bounded retry budget for failing writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts allowed per item before the queue halts.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

enum WriteJob {
    Block(Block),
    Transaction(Transaction),
    Flush(Sender<()>),
    Shutdown,
}

/// Handle to the background write worker.
pub struct WriteQueue {
    sender: Sender<WriteJob>,
    worker: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl WriteQueue {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(pool: Arc<PartitionPool>, policy: RetryPolicy) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let failed = Arc::new(AtomicBool::new(false));
        let worker_failed = Arc::clone(&failed);
        let worker = std::thread::Builder::new()
            .name("storage-writer".to_string())
            .spawn(move || worker_loop(&pool, policy, &receiver, &worker_failed))?;
        debug!("write queue started");
        Ok(Self {
            sender,
            worker: Some(worker),
            failed,
        })
    }

    /// Whether the queue has halted after exhausting a retry budget.
    pub fn is_halted(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Enqueues a block write. Returns false if the queue has halted.
    pub fn enqueue_block(&self, block: Block) -> bool {
        !self.is_halted() && self.sender.send(WriteJob::Block(block)).is_ok()
    }

    /// Enqueues a transaction write. Returns false if the queue has halted.
    pub fn enqueue_transaction(&self, tx: Transaction) -> bool {
        !self.is_halted() && self.sender.send(WriteJob::Transaction(tx)).is_ok()
    }

    /// Number of writes waiting in the queue.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    /// Blocks until every write enqueued before this call has been
    /// applied. Returns false if the queue has halted.
    pub fn flush(&self) -> bool {
        let (reply, done) = crossbeam_channel::bounded(1);
        if self.sender.send(WriteJob::Flush(reply)).is_err() {
            return false;
        }
        done.recv().is_ok()
    }

    /// Drains remaining writes and stops the worker thread.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.sender.send(WriteJob::Shutdown);
            if worker.join().is_err() {
                error!("write queue worker panicked during shutdown");
            }
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    pool: &PartitionPool,
    policy: RetryPolicy,
    receiver: &Receiver<WriteJob>,
    failed: &AtomicBool,
) {
    while let Ok(job) = receiver.recv() {
        match job {
            WriteJob::Shutdown => break,
            WriteJob::Flush(reply) => {
                let _ = reply.send(());
            }
            job => {
                if !apply_with_retry(pool, policy, &job) {
                    failed.store(true, Ordering::Release);
                    error!(
                        max_attempts = policy.max_attempts,
                        "write queue halted after exhausting retries"
                    );
                    return;
                }
            }
        }
    }
    info!("write queue worker stopped");
}

fn apply_with_retry(pool: &PartitionPool, policy: RetryPolicy, job: &WriteJob) -> bool {
    let mut attempts = 0;
    loop {
        let result = match job {
            WriteJob::Block(block) => pool.insert_block(block),
            WriteJob::Transaction(tx) => pool.insert_transaction(tx),
            WriteJob::Flush(_) | WriteJob::Shutdown => return true,
        };
        match result {
            Ok(()) => return true,
            Err(error) => {
                attempts += 1;
                dump_failed_job(job, attempts, &error);
                if !policy.should_retry(attempts) {
                    return false;
                }
            }
        }
    }
}

/// Logs a full forensic dump of a failing write so the item can be
/// reconstructed from the log after a halt.
fn dump_failed_job(job: &WriteJob, attempt: u32, error: &crate::pool::PoolError) {
    match job {
        WriteJob::Block(block) => {
            let bytes = block
                .header_bytes()
                .map(hex::encode)
                .unwrap_or_else(|_| "<unencodable>".to_string());
            error!(
                attempt,
                %error,
                height = block.height(),
                checksum = hex::encode(block.checksum),
                transactions = block.transaction_ids.len(),
                signatures = block.signatures.len(),
                header = %bytes,
                "block write failed"
            );
        }
        WriteJob::Transaction(tx) => {
            let bytes = tx
                .to_bytes()
                .map(hex::encode)
                .unwrap_or_else(|_| "<unencodable>".to_string());
            error!(
                attempt,
                %error,
                id = %tx.id,
                applied_height = tx.applied_height,
                senders = tx.senders.len(),
                receivers = tx.receivers.len(),
                body = %bytes,
                "transaction write failed"
            );
        }
        WriteJob::Flush(_) | WriteJob::Shutdown => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use num_bigint::BigUint;

    use strata_types::{
        sha256, Address, BlockHeader, StorageConfig, TransactionId, TxType, ZERO_HASH,
    };

    use crate::backend::BackendKind;

    use super::*;

    fn memory_pool() -> Arc<PartitionPool> {
        let config = StorageConfig::builder()
            .partition_size(10)
            .max_open_partitions(4)
            .retention_window(10)
            .cache_size_bytes(8 * 1024 * 1024)
            .build()
            .expect("valid config");
        Arc::new(PartitionPool::new(
            Path::new("/tmp/strata-writer-test"),
            BackendKind::Memory,
            config,
        ))
    }

    fn test_block(height: u64) -> Block {
        let header = BlockHeader {
            version: 1,
            height,
            timestamp: 1_700_000_000,
            previous_checksum: ZERO_HASH,
        };
        let mut block = Block {
            checksum: ZERO_HASH,
            header,
            transaction_ids: Vec::new(),
            signatures: Vec::new(),
            signature_count: 0,
            total_signer_difficulty: BigUint::from(1u8),
            pow_field: None,
            from_local_storage: false,
        };
        block.checksum = block.compute_checksum().expect("checksum");
        block
    }

    #[test]
    fn test_retry_policy_bounds_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
        assert!(!policy.should_retry(11));
    }

    #[test]
    fn test_queue_applies_writes_in_order() {
        let pool = memory_pool();
        let mut queue =
            WriteQueue::start(Arc::clone(&pool), RetryPolicy::default()).expect("start");

        for height in 0..5 {
            assert!(queue.enqueue_block(test_block(height)));
        }
        let mut tx = strata_types::Transaction {
            id: TransactionId::from_parts(3, &sha256(b"t")),
            tx_type: TxType::Normal,
            applied_height: 3,
            senders: BTreeMap::from([(Address::new([9; 33]), 10u128)]),
            receivers: BTreeMap::new(),
            checksum: ZERO_HASH,
            from_local_storage: false,
        };
        tx.checksum = tx.compute_checksum().expect("checksum");
        assert!(queue.enqueue_transaction(tx.clone()));

        assert!(queue.flush());
        assert!(queue.is_empty());
        for height in 0..5 {
            assert!(pool.get_block(height).expect("get").is_some());
        }
        assert!(pool.get_transaction(&tx.id, 3).expect("get").is_some());

        queue.shutdown();
        assert!(!queue.is_halted());
    }

    #[test]
    fn test_queue_halts_after_exhausting_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig::builder()
            .partition_size(10)
            .max_open_partitions(4)
            .retention_window(10)
            .cache_size_bytes(8 * 1024 * 1024)
            // An unsatisfiable disk floor makes every write attempt fail.
            .min_free_disk_bytes(u64::MAX)
            .build()
            .expect("valid config");
        let pool = Arc::new(PartitionPool::new(dir.path(), BackendKind::File, config));
        let mut queue = WriteQueue::start(Arc::clone(&pool), RetryPolicy { max_attempts: 3 })
            .expect("start");

        assert!(queue.enqueue_block(test_block(1)));
        for _ in 0..500 {
            if queue.is_halted() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(queue.is_halted());
        // A halted queue refuses new work instead of buffering it.
        assert!(!queue.enqueue_block(test_block(2)));
        queue.shutdown();
    }
}
