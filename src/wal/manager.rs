//! Log Manager
//!
//! Owns the log file, the LSN allocator and the LSN → offset index.
//!
//! ## Concurrency
//! - `tail`: the single serialization point. Assigning an LSN and writing
//!   its bytes happen under one lock, so LSN order is physical order.
//! - `sync_file`: a second handle used by `flush`. Syncing happens outside
//!   the tail lock, so a flush never blocks unrelated appends.
//! - `reader`: a third handle for random-access reads by LSN.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::WalSyncStrategy;
use crate::error::Result;
use crate::lsn::{Lsn, LsnAllocator};
use crate::AtlasError;

use super::reader::LogReader;
use super::record::{decode_frame, Frame, LogRecord};
use super::scan::{ChainScan, Direction, ForwardScan, LogScan};
use super::verify::{scan_file, FrameLocation, LogScanReport};
use super::writer::LogWriter;

/// Mutable state of the log tail, guarded by one lock
struct LogTail {
    writer: LogWriter,
    lsns: LsnAllocator,
    index: BTreeMap<Lsn, FrameLocation>,
    last_lsn: Option<Lsn>,
}

/// Append-only durable log of records
pub struct LogManager {
    path: PathBuf,

    /// Writer, allocator and index (append lock)
    tail: Mutex<LogTail>,

    /// Handle used for fsync; its lock also serializes flushers
    sync_file: Mutex<File>,

    /// Handle used for reads by LSN
    reader: Mutex<File>,

    /// Highest LSN known to be on stable storage (0 = none)
    durable_lsn: AtomicU64,

    /// Set after a failed write or sync; the log accepts nothing afterwards
    failed: AtomicBool,

    /// What the scan on open found
    open_report: LogScanReport,
}

impl LogManager {
    /// Open or create the log at `path`
    ///
    /// Scans the existing file, truncates a torn tail, and resumes LSN
    /// allocation after the last valid record. Corruption before the tail
    /// fails the open.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let (report, index) = scan_file(path)?;

        let mut writer = LogWriter::open(path, sync_strategy, report.valid_len)?;
        writer.sync()?;
        let sync_file = writer.sync_handle()?;
        let reader = File::open(path)?;

        tracing::info!(
            path = %path.display(),
            records = report.records,
            last_lsn = ?report.last_lsn,
            torn_tail = report.was_truncated,
            "log opened"
        );

        let last_lsn = report.last_lsn;
        Ok(Self {
            path: path.to_path_buf(),
            tail: Mutex::new(LogTail {
                writer,
                lsns: LsnAllocator::resume_after(last_lsn),
                index,
                last_lsn,
            }),
            sync_file: Mutex::new(sync_file),
            reader: Mutex::new(reader),
            durable_lsn: AtomicU64::new(last_lsn.map(Lsn::as_u64).unwrap_or(0)),
            failed: AtomicBool::new(false),
            open_report: report,
        })
    }

    /// Append a record, assigning it the next LSN
    ///
    /// The record's `lsn` field is overwritten. Does not wait for
    /// durability unless the sync strategy asks for it.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        self.ensure_usable()?;

        let mut tail = self.tail.lock();
        let lsn = tail.lsns.peek();
        record.lsn = lsn;
        let frame = record.serialize()?;

        let offset = match tail.writer.write_frame(&frame) {
            Ok(offset) => offset,
            Err(e) => return Err(self.fail(e)),
        };
        tail.lsns.next();
        tail.index.insert(
            lsn,
            FrameLocation {
                offset,
                len: frame.len() as u64,
            },
        );
        tail.last_lsn = Some(lsn);

        if tail.writer.should_sync() {
            if let Err(e) = tail.writer.sync() {
                return Err(self.fail(e));
            }
            self.durable_lsn.fetch_max(lsn.as_u64(), Ordering::SeqCst);
        }

        tracing::trace!(lsn = %lsn, txn = record.txn_id, kind = ?record.kind, "appended");
        Ok(lsn)
    }

    /// Make every record with LSN ≤ `upto` durable before returning
    ///
    /// Fails with `RecordNotFound` when `upto` was never appended.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        if self.is_durable(upto) {
            return Ok(());
        }
        self.ensure_usable()?;

        let sync_file = self.sync_file.lock();
        if self.is_durable(upto) {
            return Ok(());
        }

        // Everything written so far is covered by this sync
        let target = match self.tail.lock().last_lsn {
            Some(last) if upto <= last => last,
            _ => return Err(AtlasError::RecordNotFound(upto)),
        };

        if let Err(e) = sync_file.sync_data() {
            return Err(self.fail(AtlasError::LogIo(format!("fsync failed: {}", e))));
        }
        self.durable_lsn.fetch_max(target.as_u64(), Ordering::SeqCst);
        tracing::debug!(upto = %upto, durable = %target, "log flushed");
        Ok(())
    }

    /// Flush everything appended so far
    pub fn flush_all(&self) -> Result<()> {
        match self.last_lsn() {
            Some(last) => self.flush(last),
            None => Ok(()),
        }
    }

    /// Read one record by LSN
    pub fn read_record(&self, lsn: Lsn) -> Result<LogRecord> {
        let location = self
            .tail
            .lock()
            .index
            .get(&lsn)
            .copied()
            .ok_or(AtlasError::RecordNotFound(lsn))?;

        let mut buf = vec![0u8; location.len as usize];
        {
            let mut file = self.reader.lock();
            file.seek(SeekFrom::Start(location.offset))?;
            file.read_exact(&mut buf)?;
        }

        match decode_frame(&buf) {
            Frame::Complete(record, _) if record.lsn == lsn => Ok(record),
            Frame::Complete(record, _) => Err(AtlasError::LogCorruption {
                offset: location.offset,
                reason: format!("expected LSN {}, found {}", lsn, record.lsn),
            }),
            Frame::Incomplete => Err(AtlasError::LogCorruption {
                offset: location.offset,
                reason: format!("record {} is incomplete", lsn),
            }),
            Frame::Corrupt(reason) => Err(AtlasError::LogCorruption {
                offset: location.offset,
                reason,
            }),
        }
    }

    /// Lazy scan starting at `from`
    ///
    /// Forward scans follow physical order and include `from` (or the first
    /// record after it). Backward scans follow `prev_lsn` links starting at
    /// the record `from`.
    pub fn scan(&self, from: Lsn, direction: Direction) -> Result<LogScan<'_>> {
        match direction {
            Direction::Forward => Ok(LogScan::Forward(self.scan_forward(from)?)),
            Direction::Backward => Ok(LogScan::Backward(self.scan_chain(from))),
        }
    }

    /// Records with LSN ≥ `from` in physical order, up to the current tail
    pub fn scan_forward(&self, from: Lsn) -> Result<ForwardScan> {
        let (start, limit) = {
            let tail = self.tail.lock();
            let limit = tail.writer.offset();
            let start = tail
                .index
                .range(from..)
                .next()
                .map(|(_, location)| location.offset)
                .unwrap_or(limit);
            (start, limit)
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(ForwardScan::new(LogReader::new(BufReader::new(file), start, limit)))
    }

    /// Backward walk over one transaction's chain, starting at `from`
    pub fn scan_chain(&self, from: Lsn) -> ChainScan<'_> {
        ChainScan::new(self, Some(from))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// LSN of the last appended record
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.tail.lock().last_lsn
    }

    /// LSN the next append will receive
    pub fn next_lsn(&self) -> Lsn {
        self.tail.lock().lsns.peek()
    }

    /// Highest LSN known durable
    pub fn durable_lsn(&self) -> Option<Lsn> {
        match self.durable_lsn.load(Ordering::SeqCst) {
            0 => None,
            lsn => Some(Lsn(lsn)),
        }
    }

    pub fn is_durable(&self, lsn: Lsn) -> bool {
        self.durable_lsn.load(Ordering::SeqCst) >= lsn.as_u64()
    }

    /// Size of the log in bytes
    pub fn end_offset(&self) -> u64 {
        self.tail.lock().writer.offset()
    }

    /// Number of records in the log
    pub fn record_count(&self) -> usize {
        self.tail.lock().index.len()
    }

    pub fn contains(&self, lsn: Lsn) -> bool {
        self.tail.lock().index.contains_key(&lsn)
    }

    /// What the scan on open found (torn tail, record counts)
    pub fn open_report(&self) -> &LogScanReport {
        &self.open_report
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a write or sync failed; the log is then read-only
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_usable(&self) -> Result<()> {
        if self.has_failed() {
            return Err(AtlasError::LogIo(
                "log refused write after an earlier failure".to_string(),
            ));
        }
        Ok(())
    }

    fn fail(&self, err: AtlasError) -> AtlasError {
        self.failed.store(true, Ordering::SeqCst);
        tracing::error!(error = %err, "log write failed; refusing further writes");
        match err {
            AtlasError::LogIo(_) => err,
            other => AtlasError::LogIo(other.to_string()),
        }
    }
}
