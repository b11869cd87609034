//! A single storage partition.
//!
//! Each partition owns one store covering a contiguous range of block
//! heights and is opened and closed independently of its siblings. Every
//! mutating operation runs as one atomic write batch: either all rows of a
//! block or transaction land, or none do.
//!
//! A partition that exists on disk but fails to open, or whose meta table
//! is unreadable, reports a hard error. It is never silently treated as
//! empty, since doing so would let a single corrupt store masquerade as a
//! gap in history.

use std::path::{Path, PathBuf};
use std::time::Instant;

use num_bigint::BigUint;
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use strata_types::{
    codec::{self, CodecError},
    Address, Block, Hash, Transaction, TransactionId, TxType, TX_ID_LEN,
};

use crate::backend::{BackendKind, STORE_FILE};
use crate::keys::{
    self, KeyError, BLOCK_PRIMARY_INDEX, BLOCK_RECORD_HEADER, BLOCK_RECORD_SIGNERS,
    BLOCK_RECORD_SIGNERS_COMPACT, BLOCK_RECORD_TX_IDS, TX_RECORD_BODY,
};
use crate::tables::{
    Tables, FORMAT_VERSION, META_FORMAT_VERSION, META_MAX_BLOCK, META_MIN_BLOCK,
};

const EMPTY: &[u8] = &[];

/// Partition-level storage errors.
#[derive(Debug, Snafu)]
pub enum PartitionError {
    /// The store could not be created or opened.
    #[snafu(display("Failed to open partition {id} at {}: {source}", path.display()))]
    Open {
        /// Partition id.
        id: u64,
        /// Store path.
        path: PathBuf,
        /// Underlying database error.
        source: redb::DatabaseError,
    },

    /// A row read or write failed.
    #[snafu(display("Partition storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        source: redb::StorageError,
    },

    /// A table could not be opened.
    #[snafu(display("Partition table error: {source}"))]
    Table {
        /// Underlying table error.
        source: redb::TableError,
    },

    /// A transaction could not be started.
    #[snafu(display("Partition transaction error: {source}"))]
    Transaction {
        /// Underlying transaction error.
        source: redb::TransactionError,
    },

    /// A write batch could not be committed.
    #[snafu(display("Partition commit error: {source}"))]
    Commit {
        /// Underlying commit error.
        source: redb::CommitError,
    },

    /// An operation was attempted on a closed partition.
    #[snafu(display("Partition {id} is not open"))]
    NotOpen {
        /// Partition id.
        id: u64,
    },

    /// Stored data failed an integrity check.
    #[snafu(display("Partition at {} is corrupt: {reason}", path.display()))]
    Corrupt {
        /// Store path.
        path: PathBuf,
        /// What failed.
        reason: String,
    },

    /// A stored key failed to parse.
    #[snafu(display("Partition key error: {source}"))]
    Key {
        /// Underlying key error.
        source: KeyError,
    },

    /// A stored value failed to decode.
    #[snafu(display("Partition codec error: {source}"))]
    Codec {
        /// Underlying codec error.
        source: CodecError,
    },

    /// A filesystem operation failed.
    #[snafu(display("Partition I/O error at {}: {source}", path.display()))]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Per-block metadata stored alongside the primary index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockMeta {
    signature_count: u64,
    total_signer_difficulty: BigUint,
    pow_field: Option<Vec<u8>>,
}

/// One storage partition covering a contiguous height range.
pub struct Partition {
    id: u64,
    path: PathBuf,
    backend: BackendKind,
    db: Option<Database>,
    min_block: Option<u64>,
    max_block: Option<u64>,
    format_version: u32,
    last_used: Instant,
    cache_size: usize,
}

impl Partition {
    /// Creates a partition handle in the closed state.
    pub fn new(id: u64, base: &Path, backend: BackendKind, cache_size: usize) -> Self {
        Self {
            id,
            path: base.join(id.to_string()),
            backend,
            db: None,
            min_block: None,
            max_block: None,
            format_version: FORMAT_VERSION,
            last_used: Instant::now(),
            cache_size,
        }
    }

    /// Partition id (block height divided by partition size).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lowest stored block height, if any.
    pub fn min_block(&self) -> Option<u64> {
        self.min_block
    }

    /// Highest stored block height, if any.
    pub fn max_block(&self) -> Option<u64> {
        self.max_block
    }

    /// Whether the store is currently open.
    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// When this partition last served an operation.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Opens the store, creating it if absent. Idempotent.
    ///
    /// All tables are created up front so reads never observe a missing
    /// table, and the meta table is read to restore the cached height
    /// bounds.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Open`] if the store cannot be opened and
    /// [`PartitionError::Corrupt`] if the meta table is unreadable.
    pub fn open(&mut self) -> Result<(), PartitionError> {
        if self.db.is_some() {
            return Ok(());
        }

        let db = match self.backend {
            BackendKind::File => {
                std::fs::create_dir_all(&self.path).context(IoSnafu {
                    path: self.path.clone(),
                })?;
                let store = self.path.join(STORE_FILE);
                redb::Builder::new()
                    .set_cache_size(self.cache_size)
                    .create(&store)
                    .context(OpenSnafu {
                        id: self.id,
                        path: store,
                    })?
            }
            BackendKind::Memory => redb::Builder::new()
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .context(OpenSnafu {
                    id: self.id,
                    path: self.path.clone(),
                })?,
        };

        let txn = db.begin_write().context(TransactionSnafu)?;
        let (format_version, min_block, max_block) = {
            let blocks = txn.open_table(Tables::BLOCKS).context(TableSnafu)?;
            let transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;
            let idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;
            let idx_applied = txn.open_table(Tables::IDX_TX_APPLIED).context(TableSnafu)?;
            let idx_address = txn.open_table(Tables::IDX_ADDRESS).context(TableSnafu)?;
            drop((blocks, transactions, idx_blocks, idx_applied, idx_address));

            let mut meta = txn.open_table(Tables::META).context(TableSnafu)?;
            let version_row = meta
                .get(META_FORMAT_VERSION)
                .context(StorageSnafu)?
                .map(|guard| guard.value().to_vec());
            let format_version = match version_row {
                Some(raw) => {
                    let bytes: [u8; 4] =
                        raw.as_slice()
                            .try_into()
                            .map_err(|_| PartitionError::Corrupt {
                                path: self.path.clone(),
                                reason: "format_version row has wrong length".to_string(),
                            })?;
                    let version = u32::from_le_bytes(bytes);
                    if version > FORMAT_VERSION {
                        return Err(PartitionError::Corrupt {
                            path: self.path.clone(),
                            reason: format!("unsupported format version {version}"),
                        });
                    }
                    version
                }
                None => {
                    meta.insert(META_FORMAT_VERSION, &FORMAT_VERSION.to_le_bytes()[..])
                        .context(StorageSnafu)?;
                    FORMAT_VERSION
                }
            };
            let min_block = read_meta_height(&meta, META_MIN_BLOCK, &self.path)?;
            let max_block = read_meta_height(&meta, META_MAX_BLOCK, &self.path)?;
            (format_version, min_block, max_block)
        };
        txn.commit().context(CommitSnafu)?;

        debug!(
            partition = self.id,
            min_block, max_block, "opened partition store"
        );
        self.db = Some(db);
        self.format_version = format_version;
        self.min_block = min_block;
        self.max_block = max_block;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Closes the store, releasing its file handles and cache.
    ///
    /// In-memory partitions are left open: their data lives only in the
    /// store itself and closing would discard it.
    pub fn close(&mut self) {
        if self.backend == BackendKind::Memory {
            return;
        }
        if self.db.take().is_some() {
            debug!(partition = self.id, "closed partition store");
        }
    }

    /// Stores a block as one atomic batch: four record fragments, the
    /// primary index entry, per-block metadata, and updated height bounds.
    pub fn insert_block(&mut self, block: &Block) -> Result<(), PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let height = block.height();
        let height_be = height.to_be_bytes();
        let checksum = &block.checksum[..];

        let block_meta = codec::encode(&BlockMeta {
            signature_count: block.signature_count,
            total_signer_difficulty: block.total_signer_difficulty.clone(),
            pow_field: block.pow_field.clone(),
        })
        .context(CodecSnafu)?;

        let new_min = Some(self.min_block.map_or(height, |m| m.min(height)));
        let new_max = Some(self.max_block.map_or(height, |m| m.max(height)));

        let txn = db.begin_write().context(TransactionSnafu)?;
        {
            let mut blocks = txn.open_table(Tables::BLOCKS).context(TableSnafu)?;
            let fragments: [(&[u8], Vec<u8>); 4] = [
                (BLOCK_RECORD_HEADER, block.header_bytes().context(CodecSnafu)?),
                (
                    BLOCK_RECORD_TX_IDS,
                    block.transaction_ids_bytes().context(CodecSnafu)?,
                ),
                (
                    BLOCK_RECORD_SIGNERS,
                    block.signature_bytes(false).context(CodecSnafu)?,
                ),
                (
                    BLOCK_RECORD_SIGNERS_COMPACT,
                    block.signature_bytes(true).context(CodecSnafu)?,
                ),
            ];
            for (kind, value) in &fragments {
                let key = keys::combine_keys(checksum, kind).context(KeySnafu)?;
                blocks
                    .insert(key.as_slice(), value.as_slice())
                    .context(StorageSnafu)?;
            }

            let mut idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;
            let primary_key =
                keys::combine_keys(&height_be, BLOCK_PRIMARY_INDEX).context(KeySnafu)?;
            let previous_checksum = idx_blocks
                .insert(primary_key.as_slice(), checksum)
                .context(StorageSnafu)?
                .map(|guard| guard.value().to_vec());
            // A re-insert at the same height with different content must
            // not strand the superseded block's rows.
            if let Some(old) = previous_checksum.filter(|old| old.as_slice() != checksum) {
                for kind in [
                    BLOCK_RECORD_HEADER,
                    BLOCK_RECORD_TX_IDS,
                    BLOCK_RECORD_SIGNERS,
                    BLOCK_RECORD_SIGNERS_COMPACT,
                ] {
                    let key = keys::combine_keys(&old, kind).context(KeySnafu)?;
                    blocks.remove(key.as_slice()).context(StorageSnafu)?;
                }
                let old_meta_key = keys::combine_keys(&height_be, &old).context(KeySnafu)?;
                idx_blocks
                    .remove(old_meta_key.as_slice())
                    .context(StorageSnafu)?;
            }
            let meta_key = keys::combine_keys(&height_be, checksum).context(KeySnafu)?;
            idx_blocks
                .insert(meta_key.as_slice(), block_meta.as_slice())
                .context(StorageSnafu)?;

            let mut meta = txn.open_table(Tables::META).context(TableSnafu)?;
            write_meta_height(&mut meta, META_MIN_BLOCK, new_min)?;
            write_meta_height(&mut meta, META_MAX_BLOCK, new_max)?;
        }
        txn.commit().context(CommitSnafu)?;

        self.min_block = new_min;
        self.max_block = new_max;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Stores a transaction and its index entries as one atomic batch.
    pub fn insert_transaction(&mut self, tx: &Transaction) -> Result<(), PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let body = tx.to_bytes().context(CodecSnafu)?;
        let applied_be = tx.applied_height.to_be_bytes();

        let txn = db.begin_write().context(TransactionSnafu)?;
        {
            let mut transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;
            let body_key =
                keys::combine_keys(tx.id.as_bytes(), TX_RECORD_BODY).context(KeySnafu)?;
            transactions
                .insert(body_key.as_slice(), body.as_slice())
                .context(StorageSnafu)?;

            let mut idx_applied = txn.open_table(Tables::IDX_TX_APPLIED).context(TableSnafu)?;
            let fragment = keys::type_and_txid_fragment(tx.tx_type, &tx.id);
            let applied_key = keys::combine_keys(&applied_be, &fragment).context(KeySnafu)?;
            idx_applied
                .insert(applied_key.as_slice(), EMPTY)
                .context(StorageSnafu)?;

            let mut idx_address = txn.open_table(Tables::IDX_ADDRESS).context(TableSnafu)?;
            let fragment = keys::applied_and_txid_fragment(tx.applied_height, &tx.id);
            for address in tx.senders.keys().chain(tx.receivers.keys()) {
                let key = keys::combine_keys(keys::key_prefix(address.as_bytes()), &fragment)
                    .context(KeySnafu)?;
                idx_address
                    .insert(key.as_slice(), EMPTY)
                    .context(StorageSnafu)?;
            }
        }
        txn.commit().context(CommitSnafu)?;

        self.last_used = Instant::now();
        Ok(())
    }

    /// Reads a block by height. Heights outside this partition's stored
    /// bounds return `None` without touching the store.
    pub fn get_block(&mut self, height: u64) -> Result<Option<Block>, PartitionError> {
        if !self.covers(height) {
            return Ok(None);
        }
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;

        let height_be = height.to_be_bytes();
        let Some(checksum) = read_row(
            &idx_blocks,
            &keys::combine_keys(&height_be, BLOCK_PRIMARY_INDEX).context(KeySnafu)?,
        )?
        else {
            return Ok(None);
        };

        let blocks = txn.open_table(Tables::BLOCKS).context(TableSnafu)?;
        let header_bytes = read_row(
            &blocks,
            &keys::combine_keys(&checksum, BLOCK_RECORD_HEADER).context(KeySnafu)?,
        )?
        .ok_or_else(|| PartitionError::Corrupt {
            path: self.path.clone(),
            reason: format!("block {height} indexed but header row missing"),
        })?;
        let tx_ids_bytes = read_row(
            &blocks,
            &keys::combine_keys(&checksum, BLOCK_RECORD_TX_IDS).context(KeySnafu)?,
        )?
        .ok_or_else(|| PartitionError::Corrupt {
            path: self.path.clone(),
            reason: format!("block {height} missing transaction id row"),
        })?;

        // Prefer full signatures, fall back to the compact signer list for
        // blocks stored by a redacting peer.
        let (sig_bytes, compact) = match read_row(
            &blocks,
            &keys::combine_keys(&checksum, BLOCK_RECORD_SIGNERS).context(KeySnafu)?,
        )? {
            Some(bytes) => (bytes, false),
            None => {
                let bytes = read_row(
                    &blocks,
                    &keys::combine_keys(&checksum, BLOCK_RECORD_SIGNERS_COMPACT)
                        .context(KeySnafu)?,
                )?
                .ok_or_else(|| PartitionError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("block {height} has no signature rows"),
                })?;
                (bytes, true)
            }
        };

        let meta_bytes = read_row(
            &idx_blocks,
            &keys::combine_keys(&height_be, &checksum).context(KeySnafu)?,
        )?
        .ok_or_else(|| PartitionError::Corrupt {
            path: self.path.clone(),
            reason: format!("block {height} missing metadata row"),
        })?;
        let block_meta: BlockMeta = codec::decode(&meta_bytes).context(CodecSnafu)?;

        let checksum: Hash = checksum
            .as_slice()
            .try_into()
            .map_err(|_| PartitionError::Corrupt {
                path: self.path.clone(),
                reason: format!("block {height} checksum has wrong length"),
            })?;

        let block = Block {
            header: Block::header_from_bytes(&header_bytes).context(CodecSnafu)?,
            checksum,
            transaction_ids: Block::transaction_ids_from_bytes(&tx_ids_bytes)
                .context(CodecSnafu)?,
            signatures: Block::signatures_from_bytes(&sig_bytes, compact).context(CodecSnafu)?,
            signature_count: block_meta.signature_count,
            total_signer_difficulty: block_meta.total_signer_difficulty,
            pow_field: block_meta.pow_field,
            from_local_storage: true,
        };
        self.last_used = Instant::now();
        Ok(Some(block))
    }

    /// Reads a block's stored bytes. In header mode the result is the
    /// header fragment followed by the compact signer fragment; otherwise
    /// it is the header, full signatures, and transaction id fragments,
    /// concatenated in that order.
    pub fn get_block_bytes(
        &mut self,
        height: u64,
        as_header: bool,
    ) -> Result<Option<Vec<u8>>, PartitionError> {
        if !self.covers(height) {
            return Ok(None);
        }
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;

        let height_be = height.to_be_bytes();
        let Some(checksum) = read_row(
            &idx_blocks,
            &keys::combine_keys(&height_be, BLOCK_PRIMARY_INDEX).context(KeySnafu)?,
        )?
        else {
            return Ok(None);
        };

        let blocks = txn.open_table(Tables::BLOCKS).context(TableSnafu)?;
        let kinds: &[&[u8]] = if as_header {
            &[BLOCK_RECORD_HEADER, BLOCK_RECORD_SIGNERS_COMPACT]
        } else {
            &[BLOCK_RECORD_HEADER, BLOCK_RECORD_SIGNERS, BLOCK_RECORD_TX_IDS]
        };
        let mut out = Vec::new();
        for kind in kinds {
            let row = read_row(
                &blocks,
                &keys::combine_keys(&checksum, kind).context(KeySnafu)?,
            )?
            .ok_or_else(|| PartitionError::Corrupt {
                path: self.path.clone(),
                reason: format!("block {height} missing record fragment"),
            })?;
            out.extend_from_slice(&row);
        }
        self.last_used = Instant::now();
        Ok(Some(out))
    }

    /// Reads the checksum and total signer difficulty of a block.
    pub fn get_block_total_signer_difficulty(
        &mut self,
        height: u64,
    ) -> Result<Option<(Hash, BigUint)>, PartitionError> {
        if !self.covers(height) {
            return Ok(None);
        }
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;

        let height_be = height.to_be_bytes();
        let Some(checksum) = read_row(
            &idx_blocks,
            &keys::combine_keys(&height_be, BLOCK_PRIMARY_INDEX).context(KeySnafu)?,
        )?
        else {
            return Ok(None);
        };
        let Some(meta_bytes) = read_row(
            &idx_blocks,
            &keys::combine_keys(&height_be, &checksum).context(KeySnafu)?,
        )?
        else {
            return Err(PartitionError::Corrupt {
                path: self.path.clone(),
                reason: format!("block {height} missing metadata row"),
            });
        };
        let block_meta: BlockMeta = codec::decode(&meta_bytes).context(CodecSnafu)?;
        let checksum: Hash = checksum
            .as_slice()
            .try_into()
            .map_err(|_| PartitionError::Corrupt {
                path: self.path.clone(),
                reason: format!("block {height} checksum has wrong length"),
            })?;
        self.last_used = Instant::now();
        Ok(Some((checksum, block_meta.total_signer_difficulty)))
    }

    /// Reads a transaction by its full id.
    pub fn get_transaction(
        &mut self,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, PartitionError> {
        match self.get_transaction_bytes(id)? {
            Some(bytes) => {
                let mut tx: Transaction = Transaction::from_bytes(&bytes).context(CodecSnafu)?;
                tx.from_local_storage = true;
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }

    /// Reads a transaction's stored bytes by its full id.
    pub fn get_transaction_bytes(
        &mut self,
        id: &TransactionId,
    ) -> Result<Option<Vec<u8>>, PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;
        let key = keys::combine_keys(id.as_bytes(), TX_RECORD_BODY).context(KeySnafu)?;
        let row = read_row(&transactions, &key)?;
        self.last_used = Instant::now();
        Ok(row)
    }

    /// Reads the transactions applied in one block, optionally filtered by
    /// type. Every index hit is verified against the full transaction row
    /// before being returned.
    pub fn get_transactions_in_block(
        &mut self,
        applied_height: u64,
        tx_type: Option<TxType>,
    ) -> Result<Vec<Transaction>, PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let idx_applied = txn.open_table(Tables::IDX_TX_APPLIED).context(TableSnafu)?;
        let transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;

        let mut out = Vec::new();
        for fragment in
            scan_secondary_fragments(&idx_applied, &applied_height.to_be_bytes())?
        {
            let (entry_type, txid_prefix) =
                keys::parse_type_and_txid(&fragment).context(KeySnafu)?;
            if tx_type.is_some_and(|wanted| wanted != entry_type) {
                continue;
            }
            if let Some((_, mut tx)) =
                find_transaction_by_prefix(&transactions, txid_prefix, applied_height)?
            {
                tx.from_local_storage = true;
                out.push(tx);
            }
        }
        self.last_used = Instant::now();
        Ok(out)
    }

    /// Like [`Self::get_transactions_in_block`], but returns the stored
    /// bytes of each transaction.
    pub fn get_transaction_bytes_in_block(
        &mut self,
        applied_height: u64,
        tx_type: Option<TxType>,
    ) -> Result<Vec<Vec<u8>>, PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let idx_applied = txn.open_table(Tables::IDX_TX_APPLIED).context(TableSnafu)?;
        let transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;

        let mut out = Vec::new();
        for fragment in
            scan_secondary_fragments(&idx_applied, &applied_height.to_be_bytes())?
        {
            let (entry_type, txid_prefix) =
                keys::parse_type_and_txid(&fragment).context(KeySnafu)?;
            if tx_type.is_some_and(|wanted| wanted != entry_type) {
                continue;
            }
            if let Some((key, _)) =
                find_transaction_by_prefix(&transactions, txid_prefix, applied_height)?
            {
                if let Some(bytes) = read_row(&transactions, &key)? {
                    out.push(bytes);
                }
            }
        }
        self.last_used = Instant::now();
        Ok(out)
    }

    /// Reads the transactions that involve an address as sender or
    /// receiver, optionally restricted to one applied height. Index hits
    /// are verified against the full row, since the index stores only a
    /// truncated address prefix.
    pub fn get_transactions_by_address(
        &mut self,
        address: &Address,
        applied_height: Option<u64>,
    ) -> Result<Vec<Transaction>, PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let idx_address = txn.open_table(Tables::IDX_ADDRESS).context(TableSnafu)?;
        let transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;

        let mut out = Vec::new();
        for fragment in
            scan_secondary_fragments(&idx_address, keys::key_prefix(address.as_bytes()))?
        {
            let (entry_applied, txid_prefix) =
                keys::parse_applied_and_txid(&fragment).context(KeySnafu)?;
            if applied_height.is_some_and(|wanted| wanted != entry_applied) {
                continue;
            }
            let Some((_, mut tx)) =
                find_transaction_by_prefix(&transactions, txid_prefix, entry_applied)?
            else {
                continue;
            };
            // Truncated address prefixes can collide; require the full
            // address to actually appear in the transaction.
            if tx.senders.contains_key(address) || tx.receivers.contains_key(address) {
                tx.from_local_storage = true;
                out.push(tx);
            }
        }
        self.last_used = Instant::now();
        Ok(out)
    }

    /// Removes a transaction and its index entries as one atomic batch.
    /// Returns false if the transaction was not present.
    pub fn remove_transaction(&mut self, id: &TransactionId) -> Result<bool, PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_write().context(TransactionSnafu)?;
        let removed = {
            let mut transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;
            let mut idx_applied = txn.open_table(Tables::IDX_TX_APPLIED).context(TableSnafu)?;
            let mut idx_address = txn.open_table(Tables::IDX_ADDRESS).context(TableSnafu)?;
            remove_transaction_rows(
                &mut transactions,
                &mut idx_applied,
                &mut idx_address,
                id,
            )?
        };
        if removed {
            txn.commit().context(CommitSnafu)?;
        } else {
            txn.abort().context(StorageSnafu)?;
        }
        self.last_used = Instant::now();
        Ok(removed)
    }

    /// Removes a block, every transaction applied in it, and all of their
    /// index entries as one atomic batch. Height bounds are recomputed
    /// from the remaining primary index entries when a bound is removed.
    /// Returns false if no block is stored at `height`.
    pub fn remove_block(&mut self, height: u64) -> Result<bool, PartitionError> {
        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let height_be = height.to_be_bytes();

        let txn = db.begin_write().context(TransactionSnafu)?;
        let (removed, new_min, new_max) = {
            let mut idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;
            let primary_key =
                keys::combine_keys(&height_be, BLOCK_PRIMARY_INDEX).context(KeySnafu)?;
            let Some(checksum) = read_row(&idx_blocks, &primary_key)? else {
                drop(idx_blocks);
                txn.abort().context(StorageSnafu)?;
                return Ok(false);
            };

            let mut transactions = txn.open_table(Tables::TRANSACTIONS).context(TableSnafu)?;
            let mut idx_applied = txn.open_table(Tables::IDX_TX_APPLIED).context(TableSnafu)?;
            let mut idx_address = txn.open_table(Tables::IDX_ADDRESS).context(TableSnafu)?;

            // Cascade: resolve each applied-index entry to its full
            // transaction, then delete the transaction and its indexes.
            let mut applied_ids = Vec::new();
            for fragment in scan_secondary_fragments(&idx_applied, &height_be)? {
                let (_, txid_prefix) = keys::parse_type_and_txid(&fragment).context(KeySnafu)?;
                if let Some((_, tx)) =
                    find_transaction_by_prefix(&transactions, txid_prefix, height)?
                {
                    applied_ids.push(tx.id);
                }
            }
            for id in &applied_ids {
                remove_transaction_rows(
                    &mut transactions,
                    &mut idx_applied,
                    &mut idx_address,
                    id,
                )?;
            }

            let mut blocks = txn.open_table(Tables::BLOCKS).context(TableSnafu)?;
            for kind in [
                BLOCK_RECORD_HEADER,
                BLOCK_RECORD_TX_IDS,
                BLOCK_RECORD_SIGNERS,
                BLOCK_RECORD_SIGNERS_COMPACT,
            ] {
                let key = keys::combine_keys(&checksum, kind).context(KeySnafu)?;
                blocks.remove(key.as_slice()).context(StorageSnafu)?;
            }
            idx_blocks
                .remove(primary_key.as_slice())
                .context(StorageSnafu)?;
            let meta_key = keys::combine_keys(&height_be, &checksum).context(KeySnafu)?;
            idx_blocks
                .remove(meta_key.as_slice())
                .context(StorageSnafu)?;

            let (new_min, new_max) =
                if self.min_block == Some(height) || self.max_block == Some(height) {
                    recompute_bounds(&idx_blocks)?
                } else {
                    (self.min_block, self.max_block)
                };

            let mut meta = txn.open_table(Tables::META).context(TableSnafu)?;
            write_meta_height(&mut meta, META_MIN_BLOCK, new_min)?;
            write_meta_height(&mut meta, META_MAX_BLOCK, new_max)?;

            (true, new_min, new_max)
        };
        txn.commit().context(CommitSnafu)?;

        self.min_block = new_min;
        self.max_block = new_max;
        self.last_used = Instant::now();
        Ok(removed)
    }

    /// Compacts the store, reclaiming free space. Errors are logged and
    /// reported as "nothing compacted" since compaction is advisory.
    pub fn compact(&mut self) -> bool {
        let Some(db) = self.db.as_mut() else {
            return false;
        };
        match db.compact() {
            Ok(reclaimed) => {
                debug!(partition = self.id, reclaimed, "compacted partition");
                reclaimed
            }
            Err(error) => {
                warn!(partition = self.id, %error, "partition compaction failed");
                false
            }
        }
    }

    #[cfg(test)]
    fn block_row_counts(&self) -> Result<(u64, u64), PartitionError> {
        use redb::ReadableTableMetadata;

        let db = self.db.as_ref().ok_or(PartitionError::NotOpen { id: self.id })?;
        let txn = db.begin_read().context(TransactionSnafu)?;
        let blocks = txn.open_table(Tables::BLOCKS).context(TableSnafu)?;
        let idx_blocks = txn.open_table(Tables::IDX_BLOCKS).context(TableSnafu)?;
        Ok((
            blocks.len().context(StorageSnafu)?,
            idx_blocks.len().context(StorageSnafu)?,
        ))
    }

    fn covers(&self, height: u64) -> bool {
        match (self.min_block, self.max_block) {
            (Some(min), Some(max)) => height >= min && height <= max,
            _ => false,
        }
    }
}

/// Reads one row into an owned buffer.
fn read_row(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, PartitionError> {
    let row = table.get(key).context(StorageSnafu)?;
    Ok(row.map(|guard| guard.value().to_vec()))
}

/// Collects the secondary fragments of every combined key sharing
/// `primary`, in key order.
fn scan_secondary_fragments(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    primary: &[u8],
) -> Result<Vec<Vec<u8>>, PartitionError> {
    let start = keys::combine_keys(primary, EMPTY).context(KeySnafu)?;
    let mut fragments = Vec::new();
    for entry in table.range::<&[u8]>(start.as_slice()..).context(StorageSnafu)? {
        let (key_guard, _) = entry.context(StorageSnafu)?;
        let key = key_guard.value();
        if !key.starts_with(&start) {
            break;
        }
        let (_, secondary) = keys::split_combined(key).context(KeySnafu)?;
        fragments.push(secondary.to_vec());
    }
    Ok(fragments)
}

/// Resolves a truncated transaction id prefix to its full row by scanning
/// the transaction table and verifying the applied height, which filters
/// out prefix collisions. Returns the combined row key and the decoded
/// transaction.
fn find_transaction_by_prefix(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    txid_prefix: &[u8],
    expected_applied: u64,
) -> Result<Option<(Vec<u8>, Transaction)>, PartitionError> {
    let id_len = TX_ID_LEN as u16;
    let mut start = Vec::with_capacity(2 + txid_prefix.len());
    start.extend_from_slice(&id_len.to_be_bytes());
    start.extend_from_slice(txid_prefix);

    for entry in table.range::<&[u8]>(start.as_slice()..).context(StorageSnafu)? {
        let (key_guard, value_guard) = entry.context(StorageSnafu)?;
        let key = key_guard.value();
        if !key.starts_with(&start) {
            break;
        }
        let tx: Transaction = Transaction::from_bytes(value_guard.value()).context(CodecSnafu)?;
        if tx.applied_height == expected_applied {
            return Ok(Some((key.to_vec(), tx)));
        }
    }
    Ok(None)
}

/// Deletes a transaction row and its three index entry families. Returns
/// false if the row was not present.
fn remove_transaction_rows(
    transactions: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    idx_applied: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    idx_address: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    id: &TransactionId,
) -> Result<bool, PartitionError> {
    let body_key = keys::combine_keys(id.as_bytes(), TX_RECORD_BODY).context(KeySnafu)?;
    let Some(body) = transactions
        .remove(body_key.as_slice())
        .context(StorageSnafu)?
        .map(|guard| guard.value().to_vec())
    else {
        return Ok(false);
    };
    let tx: Transaction = Transaction::from_bytes(&body).context(CodecSnafu)?;

    let applied_be = tx.applied_height.to_be_bytes();
    let fragment = keys::type_and_txid_fragment(tx.tx_type, id);
    let applied_key = keys::combine_keys(&applied_be, &fragment).context(KeySnafu)?;
    idx_applied
        .remove(applied_key.as_slice())
        .context(StorageSnafu)?;

    let fragment = keys::applied_and_txid_fragment(tx.applied_height, id);
    for address in tx.senders.keys().chain(tx.receivers.keys()) {
        let key = keys::combine_keys(keys::key_prefix(address.as_bytes()), &fragment)
            .context(KeySnafu)?;
        idx_address.remove(key.as_slice()).context(StorageSnafu)?;
    }
    Ok(true)
}

/// Recomputes height bounds from the remaining primary index entries.
fn recompute_bounds(
    idx_blocks: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<(Option<u64>, Option<u64>), PartitionError> {
    let mut min = None;
    let mut max = None;
    for entry in idx_blocks.iter().context(StorageSnafu)? {
        let (key_guard, _) = entry.context(StorageSnafu)?;
        let key = key_guard.value();
        let (primary, secondary) = keys::split_combined(key).context(KeySnafu)?;
        if secondary != BLOCK_PRIMARY_INDEX {
            continue;
        }
        let Ok(bytes) = <[u8; 8]>::try_from(primary) else {
            continue;
        };
        let height = u64::from_be_bytes(bytes);
        min = Some(min.map_or(height, |m: u64| m.min(height)));
        max = Some(max.map_or(height, |m: u64| m.max(height)));
    }
    Ok((min, max))
}

fn read_meta_height(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &'static str,
    path: &Path,
) -> Result<Option<u64>, PartitionError> {
    match meta.get(key).context(StorageSnafu)? {
        Some(guard) => {
            let bytes: [u8; 8] =
                guard
                    .value()
                    .try_into()
                    .map_err(|_| PartitionError::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("meta row {key} has wrong length"),
                    })?;
            Ok(Some(u64::from_le_bytes(bytes)))
        }
        None => Ok(None),
    }
}

fn write_meta_height(
    meta: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &'static str,
    value: Option<u64>,
) -> Result<(), PartitionError> {
    match value {
        Some(height) => {
            meta.insert(key, &height.to_le_bytes()[..])
                .context(StorageSnafu)?;
        }
        None => {
            meta.remove(key).context(StorageSnafu)?;
        }
    }
    Ok(())
}
