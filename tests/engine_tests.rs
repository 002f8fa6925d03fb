//! Tests for the Engine
//!
//! These tests verify:
//! - Basic lifecycle (open, begin, log, commit, close, reopen)
//! - Commit durability and the write-ahead rule for resource flushes
//! - Concurrent transactions get strictly increasing LSNs
//! - Automatic checkpoints and configuration validation
//! - Persistence through the file-backed store
//! - Halting after a fatal failure

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use atlaswal::recovery::read_master;
use atlaswal::{
    AtlasError, Config, Engine, FileStore, Lsn, MemoryStore, Operation, ResourceStore, TxnState,
    WalSyncStrategy,
};
use common::{crash, open_engine, page, setup_temp_dir, test_config, FailingStore};

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_open_empty_directory() {
    let dir = setup_temp_dir();
    let engine = open_engine(dir.path(), Arc::new(MemoryStore::new()));

    let report = engine.last_recovery();
    assert_eq!(report.checkpoint_lsn, None);
    assert!(report.aborted.is_empty());
    assert_eq!(report.records_analyzed, 0);

    // Opening leaves a checkpoint behind
    let master = read_master(&engine.config().master_path()).unwrap();
    assert_eq!(master, Some(Lsn::FIRST));
    assert!(dir.path().join("wal.log").exists());
}

#[test]
fn test_log_commit_and_reopen() {
    let dir = setup_temp_dir();
    let store = Arc::new(MemoryStore::new());
    let res = page(1);

    let engine = open_engine(dir.path(), Arc::clone(&store));
    let txn = engine.begin_transaction().unwrap();
    assert_eq!(engine.transaction_state(txn), Some(TxnState::Active));

    let alloc = engine.log(txn, &res, Operation::Allocate { size: 4 }).unwrap();
    let update = engine
        .log(txn, &res, Operation::update(1, vec![0, 0], b"hi".to_vec()))
        .unwrap();
    assert!(update > alloc);
    assert_eq!(engine.dirty_resources(), vec![(res.clone(), alloc)]);

    let commit = engine.commit(txn).unwrap();
    assert!(engine.durable_lsn() >= Some(commit));
    assert_eq!(engine.transaction_state(txn), None);
    engine.close().unwrap();

    // A clean close leaves nothing for recovery to do
    let store = Arc::new(store.crash());
    let engine = open_engine(dir.path(), Arc::clone(&store));
    assert_eq!(engine.last_recovery().records_redone, 0);
    assert_eq!(store.image(&res), Some(vec![0, b'h', b'i', 0]));
}

#[test]
fn test_transaction_ids_survive_restart() {
    let dir = setup_temp_dir();
    let store = Arc::new(MemoryStore::new());

    let engine = open_engine(dir.path(), Arc::clone(&store));
    let mut last = 0;
    for i in 0..3 {
        last = engine.begin_transaction().unwrap();
        engine.log(last, &page(i), Operation::Allocate { size: 1 }).unwrap();
        engine.commit(last).unwrap();
    }
    let store = crash(engine, &store);

    let engine = open_engine(dir.path(), store);
    assert!(engine.begin_transaction().unwrap() > last);
}

// =============================================================================
// Durability Tests
// =============================================================================

#[test]
fn test_flush_resource_respects_write_ahead_rule() {
    let dir = setup_temp_dir();
    let store = Arc::new(MemoryStore::new());
    let engine = open_engine(dir.path(), Arc::clone(&store));
    let res = page(2);

    let txn = engine.begin_transaction().unwrap();
    let lsn = engine.log(txn, &res, Operation::Allocate { size: 8 }).unwrap();
    assert!(!engine.log_manager().is_durable(lsn));
    assert_eq!(store.durable_state(&res).version, None);

    engine.flush_resource(&res).unwrap();

    assert!(engine.log_manager().is_durable(lsn));
    assert_eq!(store.durable_state(&res).version, Some(lsn));
    assert!(engine.dirty_resources().is_empty());
}

#[test]
fn test_concurrent_transactions_get_increasing_lsns() {
    let dir = setup_temp_dir();
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(open_engine(dir.path(), Arc::clone(&store)));

    let handles: Vec<_> = (0..6u64)
        .map(|id| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let txn = engine.begin_transaction().unwrap();
                let mut lsns = vec![engine
                    .log(txn, &page(id), Operation::Allocate { size: 2 })
                    .unwrap()];
                for i in 0..50u8 {
                    lsns.push(
                        engine
                            .log(txn, &page(id), Operation::update(0, vec![i], vec![i + 1]))
                            .unwrap(),
                    );
                }
                lsns.push(engine.commit(txn).unwrap());
                lsns
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let lsns = handle.join().unwrap();
        assert!(lsns.windows(2).all(|w| w[0] < w[1]));
        assert!(lsns.into_iter().all(|lsn| seen.insert(lsn)));
    }
    assert_eq!(seen.len(), 6 * 52);

    // Every transaction's chain is intact in the log
    let engine = Arc::try_unwrap(engine).ok().unwrap();
    let store = crash(engine, &store);
    let engine = open_engine(dir.path(), Arc::clone(&store));
    assert!(engine.last_recovery().aborted.is_empty());
    for id in 0..6 {
        assert_eq!(store.image(&page(id)), Some(vec![50, 0]));
    }
}

#[test]
fn test_automatic_checkpoint() {
    let dir = setup_temp_dir();
    let config = Config::builder()
        .data_dir(dir.path())
        .checkpoint_threshold_bytes(512)
        .build();
    let engine = Engine::open(config, Arc::new(MemoryStore::new())).unwrap();
    let first = read_master(&engine.config().master_path()).unwrap();

    for i in 0..20u64 {
        let txn = engine.begin_transaction().unwrap();
        engine.log(txn, &page(i), Operation::Allocate { size: 32 }).unwrap();
        engine
            .log(txn, &page(i), Operation::update(0, vec![0; 32], vec![1; 32]))
            .unwrap();
        engine.commit(txn).unwrap();
    }

    let latest = read_master(&engine.config().master_path()).unwrap();
    assert!(latest > first);
    assert!(engine.dirty_resources().len() < 20);
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = setup_temp_dir();

    let zero_workers = Config::builder().data_dir(dir.path()).redo_workers(0).build();
    assert!(matches!(
        Engine::open(zero_workers, MemoryStore::new()),
        Err(AtlasError::Config(_))
    ));

    let zero_batch = Config::builder()
        .data_dir(dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryNEntries { count: 0 })
        .build();
    assert!(zero_batch.validate().is_err());
    assert!(test_config(dir.path()).validate().is_ok());
}

// =============================================================================
// File Store Tests
// =============================================================================

#[test]
fn test_file_store_survives_restart() {
    let dir = setup_temp_dir();
    let res = page(3);
    let resource_dir = dir.path().join("resources");

    {
        let store = FileStore::open(&resource_dir).unwrap();
        let engine = Engine::open(test_config(dir.path()), store).unwrap();
        let txn = engine.begin_transaction().unwrap();
        engine.log(txn, &res, Operation::Allocate { size: 3 }).unwrap();
        engine
            .log(txn, &res, Operation::update(0, vec![0; 3], b"abc".to_vec()))
            .unwrap();
        engine.commit(txn).unwrap();

        let loser = engine.begin_transaction().unwrap();
        engine
            .log(loser, &res, Operation::update(0, b"a".to_vec(), b"z".to_vec()))
            .unwrap();
        // Crash: nothing written back, the loser never finished
        assert!(engine.store().dirty_count() > 0);
    }

    let store = FileStore::open(&resource_dir).unwrap();
    let engine = Engine::open(test_config(dir.path()), store).unwrap();
    assert_eq!(engine.last_recovery().aborted.len(), 1);
    let state = engine.store().read_state(&res).unwrap();
    assert_eq!(state.image, Some(b"abc".to_vec()));
    engine.close().unwrap();

    // Recovery's result was written back by the closing checkpoint
    let reopened = FileStore::open(&resource_dir).unwrap();
    assert_eq!(reopened.read_state(&res).unwrap().image, Some(b"abc".to_vec()));
}

// =============================================================================
// Halt Tests
// =============================================================================

#[test]
fn test_apply_failure_halts_engine() {
    let dir = setup_temp_dir();
    let store = Arc::new(FailingStore::new(MemoryStore::new()));
    let engine = Engine::open(test_config(dir.path()), Arc::clone(&store)).unwrap();
    store.fail_writes_after(engine.log_manager().last_lsn().unwrap());

    let txn = engine.begin_transaction().unwrap();
    let err = engine
        .log(txn, &page(1), Operation::Allocate { size: 1 })
        .unwrap_err();
    assert!(matches!(err, AtlasError::Storage(_)));
    assert!(engine.is_halted());
    assert!(matches!(engine.commit(txn), Err(AtlasError::EngineHalted)));
    assert!(matches!(engine.flush(Lsn::FIRST), Err(AtlasError::EngineHalted)));
    drop(engine);

    // The logged change is rolled back by the next recovery
    let store = Arc::new(FailingStore::new(MemoryStore::new()));
    let engine = Engine::open(test_config(dir.path()), store).unwrap();
    assert_eq!(engine.last_recovery().aborted, vec![txn]);
}
