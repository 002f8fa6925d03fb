//! Log Reader
//!
//! Reads records sequentially from a byte range of the log file.
//!
//! ## Tail Handling
//! The last write before a crash may be incomplete. A partial header, a
//! verified header whose body runs past the end of the range, or a final
//! frame whose body checksum fails, is a torn tail: the reader stops there
//! and reports `torn_tail()`. A complete header that fails its own checksum
//! is corruption wherever it sits, since its length cannot be trusted to
//! say whether anything follows it.

use std::io::{ErrorKind, Read};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::AtlasError;

use super::record::{decode_body, decode_header, LogRecord, HEADER_SIZE};

/// Reads records from `offset` up to `limit`
pub struct LogReader<R: Read> {
    reader: R,
    offset: u64,
    limit: u64,
    last_lsn: Option<Lsn>,
    torn_tail: bool,
    finished: bool,
}

impl<R: Read> LogReader<R> {
    /// `reader` must be positioned at `offset`
    pub fn new(reader: R, offset: u64, limit: u64) -> Self {
        Self {
            reader,
            offset,
            limit,
            last_lsn: None,
            torn_tail: false,
            finished: false,
        }
    }

    /// Only accept LSNs greater than `lsn` (continuing an earlier read)
    pub fn after(mut self, lsn: Option<Lsn>) -> Self {
        self.last_lsn = lsn;
        self
    }

    /// Byte offset of the next frame
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Whether reading stopped at an incomplete final record
    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// LSN of the last record returned
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// Read the next record together with its starting offset
    pub fn next_entry(&mut self) -> Result<Option<(u64, LogRecord)>> {
        if self.finished {
            return Ok(None);
        }

        let start = self.offset;
        let remaining = self.limit.saturating_sub(start);
        if remaining == 0 {
            return Ok(self.stop(false));
        }
        if remaining < HEADER_SIZE as u64 {
            return Ok(self.stop(true));
        }

        let mut raw = [0u8; HEADER_SIZE];
        if !self.read_fully(&mut raw)? {
            return Ok(self.stop(true));
        }
        let header = match decode_header(&raw) {
            Ok(header) => header,
            Err(reason) => return Err(self.corrupt(start, reason)),
        };

        let frame_end = start + (HEADER_SIZE + header.body_len) as u64;
        if frame_end > self.limit {
            return Ok(self.stop(true));
        }

        let mut body = vec![0u8; header.body_len];
        if !self.read_fully(&mut body)? {
            return Ok(self.stop(true));
        }

        let record = match decode_body(&header, &body) {
            Ok(record) => record,
            Err(_) if frame_end == self.limit => return Ok(self.stop(true)),
            Err(reason) => return Err(self.corrupt(start, reason)),
        };

        if let Some(last) = self.last_lsn {
            if record.lsn <= last {
                let reason = format!("LSN {} does not follow LSN {}", record.lsn, last);
                return Err(self.corrupt(start, reason));
            }
        }

        self.offset = frame_end;
        self.last_lsn = Some(record.lsn);
        Ok(Some((start, record)))
    }

    fn stop(&mut self, torn: bool) -> Option<(u64, LogRecord)> {
        if torn {
            tracing::warn!(offset = self.offset, "torn record at log tail; treating as end of log");
        }
        self.torn_tail = torn;
        self.finished = true;
        None
    }

    fn corrupt(&mut self, offset: u64, reason: String) -> AtlasError {
        self.finished = true;
        AtlasError::LogCorruption { offset, reason }
    }

    /// Fill `buf`; false if the file ended first
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
            .map(|entry| entry.map(|(_, record)| record))
            .transpose()
    }
}
