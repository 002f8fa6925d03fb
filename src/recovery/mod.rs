//! Recovery Module
//!
//! Brings the resource store back to a consistent state after a crash using
//! the three ARIES passes. The passes run strictly in sequence:
//!
//! ```text
//!   master ──► Analysis ──► Redo ──► Undo ──► consistent state
//!              (txn table,  (repeat   (roll back
//!               dirty table) history)  losers)
//! ```
//!
//! Recovery is restartable at any point. Compensation records written by an
//! interrupted undo are part of the log the next attempt analyses, so work
//! already undone is skipped rather than repeated.

mod analysis;
mod checkpoint;
mod redo;
mod undo;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::op::CodecRegistry;
use crate::storage::{LatchTable, ResourceStore};
use crate::txn::{TransactionContext, TxnId};
use crate::wal::LogManager;

pub use analysis::{analyze, Analysis, TxnEntry};
pub use checkpoint::{read_master, write_master, CheckpointData, MASTER_FILENAME};
pub use redo::{redo, RedoStats};
pub use undo::{undo_losers, DirtyTable, UndoStats, UndoStep, Undoer};

/// What a recovery run found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Checkpoint analysis started from
    pub checkpoint_lsn: Option<Lsn>,

    /// First LSN the redo pass considered
    pub redo_start: Option<Lsn>,

    /// Records read by the analysis pass
    pub records_analyzed: u64,

    /// Records reapplied by redo
    pub records_redone: u64,

    /// Records redo found already applied
    pub records_skipped: u64,

    /// Loser transactions rolled back by undo
    pub aborted: Vec<TxnId>,

    /// Compensation records written by undo
    pub compensations_written: u64,

    /// First transaction id safe to hand out afterwards
    pub next_txn_id: TxnId,

    /// Last LSN in the log once recovery finished
    pub last_lsn: Option<Lsn>,

    /// Whether a torn record was dropped from the log tail
    pub torn_tail: bool,
}

/// Runs analysis, redo and undo over one log and resource store
pub struct RecoveryManager<'a, S: ResourceStore + ?Sized> {
    log: &'a LogManager,
    store: &'a S,
    latches: &'a LatchTable,
    codecs: &'a CodecRegistry,
    master_path: PathBuf,
    redo_workers: usize,
}

impl<'a, S: ResourceStore + ?Sized> RecoveryManager<'a, S> {
    pub fn new(
        log: &'a LogManager,
        store: &'a S,
        latches: &'a LatchTable,
        codecs: &'a CodecRegistry,
        master_path: &Path,
    ) -> Self {
        Self {
            log,
            store,
            latches,
            codecs,
            master_path: master_path.to_path_buf(),
            redo_workers: 1,
        }
    }

    /// Apply redo with `workers` threads (1 = inline)
    pub fn with_redo_workers(mut self, workers: usize) -> Self {
        self.redo_workers = workers.max(1);
        self
    }

    /// Run all three passes
    ///
    /// Any failure aborts recovery as a whole; there is no partial mode.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let checkpoint = read_master(&self.master_path)?;
        tracing::info!(
            checkpoint = ?checkpoint,
            last_lsn = ?self.log.last_lsn(),
            "starting recovery"
        );

        let analysis = analyze(self.log, self.codecs, checkpoint)?;

        let redo_stats = redo(
            self.log,
            self.store,
            self.latches,
            self.codecs,
            &analysis,
            self.redo_workers,
        )?;

        let losers: Vec<TransactionContext> = analysis
            .losers()
            .into_iter()
            .map(|(id, entry)| TransactionContext::recovered(id, entry.state, Some(entry.last_lsn)))
            .collect();
        let undoer = Undoer::new(self.log, self.store, self.latches, self.codecs);
        let undo_stats = undo_losers(&undoer, losers)?;

        let report = RecoveryReport {
            checkpoint_lsn: checkpoint,
            redo_start: analysis.redo_start(),
            records_analyzed: analysis.records,
            records_redone: redo_stats.redone,
            records_skipped: redo_stats.skipped,
            aborted: undo_stats.aborted,
            compensations_written: undo_stats.compensations,
            next_txn_id: analysis.next_txn_id,
            last_lsn: self.log.last_lsn(),
            torn_tail: self.log.open_report().was_truncated,
        };

        tracing::info!(
            redone = report.records_redone,
            aborted = report.aborted.len(),
            compensations = report.compensations_written,
            "recovery complete"
        );
        Ok(report)
    }
}
