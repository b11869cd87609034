//! End-to-end storage engine scenarios: durability across restarts,
//! sparse history, redaction, and the queued write path.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::path::Path;

use num_bigint::BigUint;
use strata_storage::StorageEngine;
use strata_types::{
    sha256, Address, BackendChoice, Block, BlockHeader, BlockSignature, StorageConfig,
    Transaction, TransactionId, TxType, ZERO_HASH,
};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn test_config(backend: BackendChoice) -> StorageConfig {
    StorageConfig::builder()
        .partition_size(10)
        .max_open_partitions(3)
        .retention_window(50)
        .cache_size_bytes(8 * 1024 * 1024)
        .min_free_disk_bytes(0)
        .backend(backend)
        .build()
        .expect("valid test config")
}

fn test_block(height: u64) -> Block {
    let header = BlockHeader {
        version: 2,
        height,
        timestamp: 1_700_000_000 + height,
        previous_checksum: sha256(&height.to_be_bytes()),
    };
    let mut block = Block {
        checksum: ZERO_HASH,
        header,
        transaction_ids: vec![TransactionId::from_parts(height, &sha256(b"tx"))],
        signatures: vec![BlockSignature {
            signer: Address::new([5; 33]),
            signature: vec![0xcd; 64],
        }],
        signature_count: 1,
        total_signer_difficulty: BigUint::from(height) * 7u32,
        pow_field: (height % 2 == 0).then(|| vec![1, 2, 3]),
        from_local_storage: false,
    };
    block.checksum = block.compute_checksum().expect("checksum");
    block
}

fn test_transaction(applied_height: u64, seed: u8) -> Transaction {
    let mut tx = Transaction {
        id: TransactionId::from_parts(applied_height, &sha256(&[seed, 0xaa])),
        tx_type: TxType::Normal,
        applied_height,
        senders: BTreeMap::from([(Address::new([seed; 33]), 1_000u128)]),
        receivers: BTreeMap::from([(Address::new([seed.wrapping_add(1); 33]), 990u128)]),
        checksum: ZERO_HASH,
        from_local_storage: false,
    };
    tx.checksum = tx.compute_checksum().expect("checksum");
    tx
}

fn open_file_engine(base: &Path) -> StorageEngine {
    init_tracing();
    StorageEngine::open(base, test_config(BackendChoice::File)).expect("open engine")
}

#[test]
fn test_history_survives_restart_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut before = Vec::new();
    {
        let engine = open_file_engine(dir.path());
        for height in 1..50 {
            engine.insert_block(test_block(height)).expect("insert");
        }
        assert!(engine.remove_block(25).expect("remove"));
        for height in 1..50 {
            before.push(engine.get_block_bytes(height, false).expect("bytes"));
        }
    }

    let engine = open_file_engine(dir.path());
    assert_eq!(engine.get_highest_block_in_storage().expect("highest"), Some(49));
    assert_eq!(engine.get_lowest_block_in_storage().expect("lowest"), Some(1));
    for (height, expected) in (1..50).zip(&before) {
        let after = engine.get_block_bytes(height, false).expect("bytes");
        assert_eq!(&after, expected, "height {height} changed across restart");
    }
    assert_eq!(engine.get_block(25).expect("get"), None);
}

#[test]
fn test_sparse_history_reports_extremes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_file_engine(dir.path());
    for height in [500, 250, 750] {
        engine.insert_block(test_block(height)).expect("insert");
    }

    assert_eq!(engine.get_highest_block_in_storage().expect("highest"), Some(750));
    assert_eq!(engine.get_lowest_block_in_storage().expect("lowest"), Some(250));
    // Heights between stored blocks are simply absent.
    assert_eq!(engine.get_block(600).expect("get"), None);

    assert!(engine.remove_block(750).expect("remove"));
    assert_eq!(engine.get_highest_block_in_storage().expect("highest"), Some(500));
}

#[test]
fn test_block_and_transactions_cascade() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_file_engine(dir.path());

    engine.insert_block(test_block(12)).expect("insert block");
    let tx_a = test_transaction(12, 1);
    let tx_b = test_transaction(12, 2);
    engine.insert_transaction(tx_a.clone()).expect("insert tx");
    engine.insert_transaction(tx_b.clone()).expect("insert tx");

    let in_block = engine
        .get_transactions_in_block(12, None)
        .expect("transactions in block");
    assert_eq!(in_block.len(), 2);

    let sender = Address::new([1; 33]);
    let by_address = engine
        .get_transactions_by_address(&sender, 12, Some(12))
        .expect("by address");
    assert_eq!(by_address.len(), 1);
    assert_eq!(by_address[0].id, tx_a.id);

    assert!(engine.remove_block(12).expect("remove"));
    assert_eq!(engine.get_transaction(&tx_a.id, 12).expect("get"), None);
    assert_eq!(engine.get_transaction(&tx_b.id, 12).expect("get"), None);
    assert!(engine
        .get_transactions_by_address(&sender, 12, None)
        .expect("by address")
        .is_empty());
}

#[test]
fn test_memory_engine_flushes_queued_writes_in_order() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let engine =
        StorageEngine::open(dir.path(), test_config(BackendChoice::Memory)).expect("open");

    for height in 0..20 {
        engine.insert_block(test_block(height)).expect("enqueue");
    }
    let tx = test_transaction(15, 4);
    engine.insert_transaction(tx.clone()).expect("enqueue");

    engine.flush_writes().expect("flush");
    assert_eq!(engine.queued_write_count(), 0);
    assert_eq!(engine.get_highest_block_in_storage().expect("highest"), Some(19));
    assert!(engine.get_transaction(&tx.id, 15).expect("get").is_some());
}

#[test]
fn test_redacting_node_trims_old_partitions() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(BackendChoice::File);
    config.store_full_history = false;
    let engine = StorageEngine::open(dir.path(), config).expect("open");

    for height in 0..40 {
        engine.insert_block(test_block(height)).expect("insert");
    }
    assert!(engine.redact_block_storage(20).expect("redact"));

    assert_eq!(engine.get_lowest_block_in_storage().expect("lowest"), Some(20));
    assert_eq!(engine.get_block(19).expect("get"), None);
    assert!(engine.get_block(20).expect("get").is_some());
    assert_eq!(engine.get_highest_block_in_storage().expect("highest"), Some(39));
}

#[test]
fn test_header_bytes_are_a_subset_of_full_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_file_engine(dir.path());
    let block = test_block(7);
    engine.insert_block(block.clone()).expect("insert");

    let full = engine
        .get_block_bytes(7, false)
        .expect("bytes")
        .expect("present");
    let header = engine
        .get_block_bytes(7, true)
        .expect("bytes")
        .expect("present");
    let header_fragment = block.header_bytes().expect("encode");
    assert!(full.starts_with(&header_fragment));
    assert!(header.starts_with(&header_fragment));
    assert!(header.len() < full.len());
}
