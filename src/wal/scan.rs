//! Log Scans
//!
//! Lazy iteration over the log. Forward scans read the file sequentially
//! through their own handle; backward scans follow a transaction's
//! `prev_lsn` chain through the log manager's index.

use std::fs::File;
use std::io::BufReader;

use crate::error::Result;
use crate::lsn::Lsn;

use super::manager::LogManager;
use super::reader::LogReader;
use super::record::LogRecord;

/// Scan direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Physical (LSN) order
    Forward,
    /// Backwards along `prev_lsn` links
    Backward,
}

/// Forward scan over a fixed snapshot of the log
///
/// Records appended after the scan was created are not visited.
pub struct ForwardScan {
    reader: LogReader<BufReader<File>>,
}

impl ForwardScan {
    pub(super) fn new(reader: LogReader<BufReader<File>>) -> Self {
        Self { reader }
    }

    /// Next record with its byte offset
    pub fn next_entry(&mut self) -> Result<Option<(u64, LogRecord)>> {
        self.reader.next_entry()
    }

    /// Byte offset of the next record
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    /// Whether the scan stopped at a torn record
    pub fn torn_tail(&self) -> bool {
        self.reader.torn_tail()
    }
}

impl Iterator for ForwardScan {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next()
    }
}

/// Walks one transaction's records from newest to oldest
pub struct ChainScan<'a> {
    log: &'a LogManager,
    next: Option<Lsn>,
}

impl<'a> ChainScan<'a> {
    pub(super) fn new(log: &'a LogManager, start: Option<Lsn>) -> Self {
        Self { log, next: start }
    }
}

impl Iterator for ChainScan<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        match self.log.read_record(lsn) {
            Ok(record) => {
                // prev_lsn must point strictly backwards or the walk never ends
                self.next = record.prev_lsn.filter(|prev| *prev < lsn);
                Some(Ok(record))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Either kind of scan
pub enum LogScan<'a> {
    Forward(ForwardScan),
    Backward(ChainScan<'a>),
}

impl Iterator for LogScan<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            LogScan::Forward(scan) => scan.next(),
            LogScan::Backward(scan) => scan.next(),
        }
    }
}
