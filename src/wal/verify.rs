//! Log Verification
//!
//! Scans a whole log file without modifying it and reports what it holds.
//! The log manager uses the same scan on open to find the valid end of the
//! log and to build its LSN index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::Result;
use crate::lsn::Lsn;

use super::reader::LogReader;
use super::record::RecordKind;

/// Result of scanning a log file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogScanReport {
    /// Number of valid records
    pub records: u64,

    /// First and last valid LSN
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,

    /// Bytes covered by valid records
    pub valid_len: u64,

    /// Size of the file on disk
    pub file_len: u64,

    /// Whether a torn record follows the valid prefix
    pub was_truncated: bool,

    /// Number of records of each kind
    pub kinds: BTreeMap<RecordKind, u64>,
}

/// Location of a record inside the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    pub offset: u64,
    pub len: u64,
}

/// Verify a log file without modifying it
///
/// A torn tail is reported through `was_truncated`; corruption before the
/// tail is an error.
pub fn verify(path: &Path) -> Result<LogScanReport> {
    Ok(scan_file(path)?.0)
}

/// Scan a log file, returning the report and the LSN → frame index
pub(crate) fn scan_file(path: &Path) -> Result<(LogScanReport, BTreeMap<Lsn, FrameLocation>)> {
    let mut report = LogScanReport::default();
    let mut index = BTreeMap::new();

    if !path.exists() {
        return Ok((report, index));
    }

    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    report.file_len = file_len;

    let mut reader = LogReader::new(BufReader::new(file), 0, file_len);
    while let Some((offset, record)) = reader.next_entry()? {
        if report.first_lsn.is_none() {
            report.first_lsn = Some(record.lsn);
        }
        report.last_lsn = Some(record.lsn);
        report.records += 1;
        *report.kinds.entry(record.kind).or_insert(0) += 1;

        index.insert(
            record.lsn,
            FrameLocation {
                offset,
                len: reader.position() - offset,
            },
        );
    }

    report.valid_len = reader.position();
    report.was_truncated = reader.torn_tail();
    Ok((report, index))
}
