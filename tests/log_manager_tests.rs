//! Tests for the Log Manager
//!
//! These tests verify:
//! - LSNs are strictly increasing and match physical order under concurrency
//! - Flush makes records durable up to the requested LSN and refuses unknown LSNs
//! - Random access by LSN and backward chain scans
//! - Torn tails are truncated on open; mid-log corruption fails the open

mod common;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use atlaswal::op::OpCode;
use atlaswal::wal::{self, Direction, LogManager, LogRecord, RecordKind};
use atlaswal::{AtlasError, Engine, Lsn, MemoryStore, Operation, Result, WalSyncStrategy};
use common::{open_engine, open_log, page, setup_temp_dir, test_config};

fn update(txn: u64, prev: Option<Lsn>, page_id: u64) -> LogRecord {
    LogRecord::normal(txn, prev, page(page_id), OpCode::UPDATE, vec![page_id as u8; 16])
}

// =============================================================================
// Append / LSN Tests
// =============================================================================

#[test]
fn test_first_lsn_and_sequence() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());

    assert_eq!(log.last_lsn(), None);
    assert_eq!(log.next_lsn(), Lsn::FIRST);

    let a = log.append(update(1, None, 1)).unwrap();
    let b = log.append(update(1, Some(a), 1)).unwrap();
    assert_eq!(a, Lsn(1));
    assert_eq!(b, Lsn(2));
    assert_eq!(log.last_lsn(), Some(b));
    assert_eq!(log.record_count(), 2);
}

#[test]
fn test_concurrent_appends_match_physical_order() {
    let dir = setup_temp_dir();
    let log = Arc::new(open_log(dir.path()));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let mut prev = None;
                let mut lsns = Vec::new();
                for _ in 0..100 {
                    let lsn = log.append(update(t + 1, prev, t)).unwrap();
                    prev = Some(lsn);
                    lsns.push(lsn);
                }
                lsns
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        let lsns = handle.join().unwrap();
        assert!(lsns.windows(2).all(|w| w[0] < w[1]));
        for lsn in lsns {
            assert!(all.insert(lsn), "LSN {} issued twice", lsn);
        }
    }
    assert_eq!(all.len(), 800);

    // File order is LSN order
    let scanned: Vec<Lsn> = log
        .scan_forward(Lsn::FIRST)
        .unwrap()
        .map(|r| r.unwrap().lsn)
        .collect();
    assert_eq!(scanned.len(), 800);
    assert!(scanned.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_lsns_resume_after_reopen() {
    let dir = setup_temp_dir();
    {
        let log = open_log(dir.path());
        for i in 0..5 {
            log.append(update(1, None, i)).unwrap();
        }
        log.flush_all().unwrap();
    }

    let log = open_log(dir.path());
    assert_eq!(log.last_lsn(), Some(Lsn(5)));
    assert_eq!(log.append(update(2, None, 9)).unwrap(), Lsn(6));
}

// =============================================================================
// Flush Tests
// =============================================================================

#[test]
fn test_flush_advances_durable_lsn() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());

    let a = log.append(update(1, None, 1)).unwrap();
    let b = log.append(update(1, Some(a), 1)).unwrap();
    assert_eq!(log.durable_lsn(), None);

    log.flush(a).unwrap();
    // One sync covers everything written so far
    assert!(log.is_durable(a));
    assert!(log.durable_lsn() >= Some(a));

    log.flush(b).unwrap();
    assert_eq!(log.durable_lsn(), Some(b));
}

#[test]
fn test_flush_past_last_lsn_is_rejected() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());

    // Nothing appended yet
    assert!(matches!(log.flush(Lsn::FIRST), Err(AtlasError::RecordNotFound(_))));

    let a = log.append(update(1, None, 1)).unwrap();
    let err = log.flush(a.next()).unwrap_err();
    assert!(matches!(err, AtlasError::RecordNotFound(lsn) if lsn == a.next()));
    assert_eq!(log.durable_lsn(), None);

    // The log stays usable
    log.flush(a).unwrap();
    assert_eq!(log.durable_lsn(), Some(a));
    assert_eq!(log.append(update(1, Some(a), 1)).unwrap(), a.next());
}

#[test]
fn test_engine_flush_past_last_lsn_does_not_halt() {
    let dir = setup_temp_dir();
    let engine = open_engine(dir.path(), Arc::new(MemoryStore::new()));
    let last = engine.log_manager().last_lsn().unwrap();

    let beyond = Lsn(last.as_u64() + 10);
    assert!(matches!(engine.flush(beyond), Err(AtlasError::RecordNotFound(_))));
    assert!(!engine.is_halted());
    engine.flush(last).unwrap();
}

#[test]
fn test_every_write_strategy_syncs_each_append() {
    let dir = setup_temp_dir();
    let log = LogManager::open(&dir.path().join("sync.wal"), WalSyncStrategy::EveryWrite).unwrap();

    let lsn = log.append(update(1, None, 1)).unwrap();
    assert_eq!(log.durable_lsn(), Some(lsn));
}

// =============================================================================
// Read / Scan Tests
// =============================================================================

#[test]
fn test_read_record_by_lsn() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());

    let a = log.append(update(1, None, 1)).unwrap();
    let b = log.append(update(2, None, 2)).unwrap();

    let record = log.read_record(b).unwrap();
    assert_eq!(record.lsn, b);
    assert_eq!(record.txn_id, 2);
    assert_eq!(log.read_record(a).unwrap().resource, Some(page(1)));

    let err = log.read_record(Lsn(99)).unwrap_err();
    assert!(matches!(err, AtlasError::RecordNotFound(Lsn(99))));
}

#[test]
fn test_backward_scan_follows_one_chain() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());

    // Two transactions interleaved
    let a1 = log.append(update(1, None, 1)).unwrap();
    let b1 = log.append(update(2, None, 2)).unwrap();
    let a2 = log.append(update(1, Some(a1), 1)).unwrap();
    let _b2 = log.append(update(2, Some(b1), 2)).unwrap();
    let a3 = log.append(update(1, Some(a2), 1)).unwrap();

    let chain: Vec<Lsn> = log
        .scan(a3, Direction::Backward)
        .unwrap()
        .map(|r| r.unwrap().lsn)
        .collect();
    assert_eq!(chain, vec![a3, a2, a1]);
}

#[test]
fn test_forward_scan_from_middle_is_restartable() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());
    for i in 0..10 {
        log.append(update(1, None, i)).unwrap();
    }

    for _ in 0..2 {
        let lsns: Vec<Lsn> = log
            .scan(Lsn(7), Direction::Forward)
            .unwrap()
            .map(|r| r.unwrap().lsn)
            .collect();
        assert_eq!(lsns, vec![Lsn(7), Lsn(8), Lsn(9), Lsn(10)]);
    }

    // Records appended after a scan started are not part of it
    let scan = log.scan_forward(Lsn(10)).unwrap();
    log.append(update(1, None, 11)).unwrap();
    assert_eq!(scan.count(), 1);
}

// =============================================================================
// Torn Tail / Corruption Tests
// =============================================================================

#[test]
fn test_torn_tail_is_truncated_on_open() {
    let dir = setup_temp_dir();
    let path = dir.path().join("test.wal");
    let valid_len = {
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(update(1, None, i)).unwrap();
        }
        log.end_offset()
    };

    // Half of a fourth frame
    let mut partial = update(1, None, 4);
    partial.lsn = Lsn(4);
    let frame = partial.serialize().unwrap();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&frame[..frame.len() / 2]).unwrap();
    drop(file);

    let report = wal::verify(&path).unwrap();
    assert!(report.was_truncated);
    assert_eq!(report.records, 3);
    assert_eq!(report.valid_len, valid_len);

    let log = open_log(dir.path());
    assert!(log.open_report().was_truncated);
    assert_eq!(log.last_lsn(), Some(Lsn(3)));
    assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
    assert_eq!(log.append(update(1, None, 5)).unwrap(), Lsn(4));
}

#[test]
fn test_bad_checksum_on_last_frame_is_torn_tail() {
    let dir = setup_temp_dir();
    let path = dir.path().join("test.wal");
    {
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(update(1, None, i)).unwrap();
        }
    }

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let log = open_log(dir.path());
    assert!(log.open_report().was_truncated);
    assert_eq!(log.last_lsn(), Some(Lsn(2)));
}

#[test]
fn test_mid_log_corruption_fails_open() {
    let dir = setup_temp_dir();
    let path = dir.path().join("test.wal");
    let second_frame = {
        let log = open_log(dir.path());
        let a = log.append(update(1, None, 1)).unwrap();
        log.append(update(1, Some(a), 2)).unwrap();
        log.append(update(1, None, 3)).unwrap();
        log.read_record(a).unwrap().encoded_len().unwrap()
    };

    let mut bytes = fs::read(&path).unwrap();
    bytes[second_frame + 20] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let err = LogManager::open(&path, WalSyncStrategy::OnDemand).err().unwrap();
    assert!(matches!(err, AtlasError::LogCorruption { .. }));
    assert!(err.is_fatal());
    assert!(wal::verify(&path).is_err());
}

/// Byte offset of every frame, in LSN order
fn frame_offsets(log: &LogManager) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = 0;
    let mut lsn = Lsn::FIRST;
    while log.contains(lsn) {
        offsets.push(offset);
        offset += log.read_record(lsn).unwrap().encoded_len().unwrap();
        lsn = lsn.next();
    }
    offsets
}

/// Five records: three committed transactions' worth of changes and commits
fn write_committed_log(dir: &Path) -> Vec<usize> {
    let log = open_log(dir);
    let a = log.append(update(1, None, 1)).unwrap();
    log.append(LogRecord::commit(1, Some(a))).unwrap();
    let b = log.append(update(2, None, 2)).unwrap();
    log.append(LogRecord::commit(2, Some(b))).unwrap();
    log.append(update(3, None, 3)).unwrap();
    log.flush_all().unwrap();
    frame_offsets(&log)
}

#[test]
fn test_damaged_header_before_tail_fails_open() {
    // First frame, a middle frame, and the frame just before the tail
    for frame in [0usize, 2, 3] {
        // Length field (bytes 8..12) and an LSN byte
        for (field, patch) in [(8usize, 0x00FF_FFFFu32.to_le_bytes()), (0, [0x01, 0, 0, 0])] {
            let dir = setup_temp_dir();
            let path = dir.path().join("test.wal");
            let offsets = write_committed_log(dir.path());
            assert_eq!(offsets.len(), 5);

            let mut bytes = fs::read(&path).unwrap();
            let at = offsets[frame] + field;
            if field == 8 {
                bytes[at..at + 4].copy_from_slice(&patch);
            } else {
                bytes[at] ^= patch[0];
            }
            fs::write(&path, &bytes).unwrap();

            let err = LogManager::open(&path, WalSyncStrategy::OnDemand).err().unwrap();
            assert!(
                matches!(err, AtlasError::LogCorruption { .. }),
                "frame {} field {}: {:?}",
                frame,
                field,
                err
            );
            assert!(wal::verify(&path).is_err());

            // Nothing after the damaged frame was thrown away
            assert_eq!(fs::metadata(&path).unwrap().len(), bytes.len() as u64);
        }
    }
}

#[test]
fn test_damaged_length_fails_engine_open() {
    let dir = setup_temp_dir();
    let store = Arc::new(MemoryStore::new());
    let commits: Vec<Lsn> = {
        let engine = open_engine(dir.path(), Arc::clone(&store));
        (0..3)
            .map(|i| {
                let txn = engine.begin_transaction().unwrap();
                engine.log(txn, &page(i), Operation::Allocate { size: 1 }).unwrap();
                engine.commit(txn).unwrap()
            })
            .collect()
    };

    let path = dir.path().join("wal.log");
    let offsets = {
        let log = LogManager::open(&path, WalSyncStrategy::OnDemand).unwrap();
        assert!(commits.iter().all(|lsn| log.contains(*lsn)));
        frame_offsets(&log)
    };
    let before = fs::metadata(&path).unwrap().len();

    // Frame of the first transaction's commit; later commits follow it
    let at = offsets[(commits[0].as_u64() - 1) as usize] + 8;
    let mut bytes = fs::read(&path).unwrap();
    bytes[at..at + 4].copy_from_slice(&0x00FF_FFFFu32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let err = Engine::open(test_config(dir.path()), store).err().unwrap();
    assert!(matches!(err, AtlasError::LogCorruption { .. }));
    assert_eq!(fs::metadata(&path).unwrap().len(), before);
}

#[test]
fn test_verify_counts_kinds() {
    let dir = setup_temp_dir();
    let path = dir.path().join("test.wal");
    {
        let log = open_log(dir.path());
        let a = log.append(update(1, None, 1)).unwrap();
        log.append(LogRecord::commit(1, Some(a))).unwrap();
        log.append(LogRecord::checkpoint(Vec::new())).unwrap();
    }

    let report = wal::verify(&path).unwrap();
    assert_eq!(report.records, 3);
    assert_eq!(report.first_lsn, Some(Lsn(1)));
    assert_eq!(report.last_lsn, Some(Lsn(3)));
    assert!(!report.was_truncated);
    assert_eq!(report.kinds.get(&RecordKind::Commit), Some(&1));
    assert_eq!(report.kinds.get(&RecordKind::Normal), Some(&1));
}

#[test]
fn test_verify_missing_file_is_empty() {
    let dir = setup_temp_dir();
    let report = wal::verify(&dir.path().join("absent.wal")).unwrap();
    assert_eq!(report.records, 0);
    assert_eq!(report.last_lsn, None);
}

#[test]
fn test_records_iterate_as_results() {
    let dir = setup_temp_dir();
    let log = open_log(dir.path());
    log.append(update(1, None, 1)).unwrap();

    let records: Result<Vec<_>> = log.scan_forward(Lsn::FIRST).unwrap().collect();
    assert_eq!(records.unwrap().len(), 1);
}
