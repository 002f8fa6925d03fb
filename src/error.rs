//! Error types for AtlasWAL
//!
//! Provides a unified error type for all operations.
//!
//! A torn tail record is deliberately absent: the reader reports it as the
//! logical end of the log, never as an error.

use thiserror::Error;

use crate::lsn::Lsn;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasWAL operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    /// Append or flush failed at the storage layer. Fatal to the engine.
    #[error("Log write failed: {0}")]
    LogIo(String),

    /// A record that is not the tail failed integrity checks.
    #[error("Log corruption at offset {offset}: {reason}")]
    LogCorruption { offset: u64, reason: String },

    #[error("Log record {0} not found")]
    RecordNotFound(Lsn),

    // -------------------------------------------------------------------------
    // Recovery Errors
    // -------------------------------------------------------------------------
    /// Applying a compensation to its resource failed.
    #[error("Undo of record {lsn} failed: {reason}")]
    UndoApplication { lsn: Lsn, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No codec registered for operation code {0}")]
    UnknownOpCode(u16),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The operation does not match the resource it targets; nothing was logged.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Engine halted after a fatal failure; restart to run recovery")]
    EngineHalted,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Whether this failure must stop the engine from accepting more work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AtlasError::LogIo(_)
                | AtlasError::LogCorruption { .. }
                | AtlasError::UndoApplication { .. }
                | AtlasError::EngineHalted
        )
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(err: bincode::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}
