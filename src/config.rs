//! Configuration for AtlasWAL
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{AtlasError, Result};

/// Main configuration for an AtlasWAL engine instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for the log files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal.log          (write-ahead log)
    ///     └── wal.master       (last checkpoint LSN)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the log
    pub wal_sync_strategy: WalSyncStrategy,

    /// Take a checkpoint after commit/abort once this many log bytes were
    /// written since the previous one (0 disables)
    pub checkpoint_threshold_bytes: u64,

    // -------------------------------------------------------------------------
    // Recovery Configuration
    // -------------------------------------------------------------------------
    /// Worker threads used by the redo pass (1 = apply inline)
    pub redo_workers: usize,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync only on explicit flush (commit, checkpoint, WAL rule)
    OnDemand,

    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N appended records (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlaswal_data"),
            wal_sync_strategy: WalSyncStrategy::OnDemand,
            checkpoint_threshold_bytes: 16 * 1024 * 1024, // 16 MB
            redo_workers: 1,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.redo_workers == 0 {
            return Err(AtlasError::Config("redo_workers must be at least 1".to_string()));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(AtlasError::Config(
                "EveryNEntries requires a non-zero count".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the write-ahead log file
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(crate::wal::WAL_FILENAME)
    }

    /// Path of the master checkpoint record
    pub fn master_path(&self) -> PathBuf {
        self.data_dir.join(crate::recovery::MASTER_FILENAME)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for the log files)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the automatic checkpoint threshold (in bytes)
    pub fn checkpoint_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.checkpoint_threshold_bytes = bytes;
        self
    }

    /// Set the number of redo worker threads
    pub fn redo_workers(mut self, count: usize) -> Self {
        self.config.redo_workers = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
