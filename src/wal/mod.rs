//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Assign LSNs in physical append order
//! - CRC32 checksums for corruption detection
//! - Forced flush up to a given LSN
//! - Forward scans (redo) and backward chain scans (undo)
//! - Torn tail detection and truncation on open
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Record 1                                                 │
//! │ ┌─────────┬─────────┬────────────┬──────────┬──────────┐ │
//! │ │ LSN (8) │ Len (4) │ HdrCRC (4) │ CRC (4)  │ Body     │ │
//! │ └─────────┴─────────┴────────────┴──────────┴──────────┘ │
//! ├──────────────────────────────────────────────────────────┤
//! │ Record 2 ...                                             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Body (bincode): txn_id, prev_lsn, resource, kind, undo_next_lsn, op_code,
//! payload. The header CRC covers the LSN and length, so a damaged length is
//! caught before it is used. The body CRC covers the LSN bytes and the body.

mod manager;
mod reader;
mod record;
mod scan;
mod verify;
mod writer;

pub use manager::LogManager;
pub use reader::LogReader;
pub use record::{
    decode_frame, Frame, FrameHeader, LogRecord, RecordKind, HEADER_SIZE, MAX_BODY_SIZE,
};
pub use scan::{ChainScan, Direction, ForwardScan, LogScan};
pub use verify::{verify, FrameLocation, LogScanReport};
pub use writer::LogWriter;

/// File name of the log inside the data directory
pub const WAL_FILENAME: &str = "wal.log";
