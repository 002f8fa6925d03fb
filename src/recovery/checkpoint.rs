//! Checkpoint Records
//!
//! A checkpoint bounds how far back analysis has to scan. The checkpoint
//! record itself lives in the log; a small master file next to the log
//! points at the most recent one.
//!
//! ## Master File Format
//! ```text
//! ┌──────────┬──────────────────┬─────────┐
//! │Magic (4) │ Checkpoint LSN(8)│ CRC (4) │
//! └──────────┴──────────────────┴─────────┘
//! ```
//! The master is replaced by write-temp + rename, so a crash leaves either
//! the old or the new pointer, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::storage::ResourceRef;
use crate::txn::TxnId;

/// File name of the master record inside the data directory
pub const MASTER_FILENAME: &str = "wal.master";

const MASTER_MAGIC: &[u8; 4] = b"AWMR";
const MASTER_SIZE: usize = 4 + 8 + 4;

/// Snapshot carried by a checkpoint record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Transactions with an undecided outcome and the head of their chain
    pub active_txns: Vec<(TxnId, Lsn)>,

    /// Resources possibly newer in memory than on disk, with the first LSN
    /// that dirtied them
    pub dirty_resources: Vec<(ResourceRef, Lsn)>,

    /// First transaction id not yet handed out
    pub next_txn_id: TxnId,
}

/// Point the master record at `checkpoint_lsn`
pub fn write_master(path: &Path, checkpoint_lsn: Lsn) -> Result<()> {
    let lsn_bytes = checkpoint_lsn.as_u64().to_le_bytes();

    let mut buf = Vec::with_capacity(MASTER_SIZE);
    buf.extend_from_slice(MASTER_MAGIC);
    buf.extend_from_slice(&lsn_bytes);
    buf.extend_from_slice(&crc32fast::hash(&lsn_bytes).to_le_bytes());

    let tmp_path = path.with_extension("master.tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    tracing::debug!(checkpoint = %checkpoint_lsn, "master record updated");
    Ok(())
}

/// LSN of the last completed checkpoint, if any
///
/// A missing or damaged master is not fatal: analysis then starts at the
/// beginning of the log, which is always correct, just slower.
pub fn read_master(path: &Path) -> Result<Option<Lsn>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut buf = Vec::with_capacity(MASTER_SIZE);
    File::open(path)?.read_to_end(&mut buf)?;

    if buf.len() != MASTER_SIZE || &buf[0..4] != MASTER_MAGIC {
        tracing::warn!(path = %path.display(), "master record malformed; scanning whole log");
        return Ok(None);
    }

    let mut lsn_bytes = [0u8; 8];
    lsn_bytes.copy_from_slice(&buf[4..12]);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[12..16]);

    if crc32fast::hash(&lsn_bytes) != u32::from_le_bytes(crc_bytes) {
        tracing::warn!(
            path = %path.display(),
            "master record checksum mismatch; scanning whole log"
        );
        return Ok(None);
    }

    Ok(Some(Lsn(u64::from_le_bytes(lsn_bytes))))
}
