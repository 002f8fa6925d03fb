//! # AtlasWAL
//!
//! The crash-recovery core of an embedded transactional storage engine:
//! - Write-Ahead Logging (WAL) with strictly increasing LSNs
//! - Loggable / Undoable operations with compensation records
//! - ARIES-style recovery (analysis, redo, undo)
//! - Torn tail handling and checkpoints
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │        begin / log / commit / abort / checkpoint            │
//! └──────┬──────────────────┬──────────────────────┬────────────┘
//!        │                  │                      │
//!        ▼                  ▼                      ▼
//! ┌─────────────┐   ┌───────────────┐      ┌──────────────┐
//! │ Transaction │   │  Log Manager  │      │   Resource   │
//! │    Table    │   │ (append/flush │      │    Store     │
//! │ (last_lsn)  │   │  /scan, LSNs) │      │  (+ latches) │
//! └─────────────┘   └───────┬───────┘      └──────▲───────┘
//!                           │                     │
//!                           ▼                     │
//!                   ┌───────────────┐             │
//!                   │   Recovery    │─────────────┘
//!                   │ analysis/redo │  apply redo and
//!                   │     /undo     │  compensations
//!                   └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod lsn;

pub mod wal;
pub mod op;
pub mod storage;
pub mod txn;
pub mod recovery;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{Config, WalSyncStrategy};
pub use engine::Engine;
pub use lsn::Lsn;
pub use op::{Compensation, Loggable, Operation, Payload, Undoable};
pub use recovery::RecoveryReport;
pub use storage::{FileStore, MemoryStore, ResourceRef, ResourceState, ResourceStore};
pub use txn::{TxnId, TxnState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasWAL
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
