//! Log Writer
//!
//! Appends frames to the tail of the log file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::WalSyncStrategy;
use crate::error::Result;
use crate::AtlasError;

/// Writes frames to the log file
///
/// Frames go straight to the file (no user-space buffer), so a reader with
/// its own handle sees every completed append. Durability needs `sync`.
pub struct LogWriter {
    file: File,
    /// Byte offset where the next frame starts
    offset: u64,
    sync_strategy: WalSyncStrategy,
    /// Frames written since the last sync
    unsynced: usize,
}

impl LogWriter {
    /// Open or create the log, dropping everything past `valid_len`
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy, valid_len: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                dropped = file_len - valid_len,
                "truncating torn log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            file,
            offset: valid_len,
            sync_strategy,
            unsynced: 0,
        })
    }

    /// Append one encoded frame, returning the offset it starts at
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<u64> {
        let start = self.offset;
        self.file
            .write_all(frame)
            .map_err(|e| AtlasError::LogIo(format!("append at offset {} failed: {}", start, e)))?;

        self.offset += frame.len() as u64;
        self.unsynced += 1;
        Ok(start)
    }

    /// Whether the sync strategy asks for an fsync now
    pub fn should_sync(&self) -> bool {
        match self.sync_strategy {
            WalSyncStrategy::OnDemand => false,
            WalSyncStrategy::EveryWrite => self.unsynced > 0,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced >= count,
        }
    }

    /// Force written frames to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| AtlasError::LogIo(format!("fsync failed: {}", e)))?;
        self.unsynced = 0;
        Ok(())
    }

    /// Another handle on the same file, for syncing outside the append lock
    pub fn sync_handle(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Byte offset of the end of the log
    pub fn offset(&self) -> u64 {
        self.offset
    }
}
