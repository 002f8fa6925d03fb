//! Undo
//!
//! Rolls transactions back by walking their log chains newest to oldest.
//! Live aborts and the recovery undo pass share the same step, so an abort
//! interrupted by a crash is finished by recovery exactly as if it had run
//! to completion.
//!
//! ## One Step
//! ```text
//!   Normal        → generate compensation, log it (undo_next = prev_lsn),
//!                   apply it, continue at prev_lsn
//!   Compensation  → continue at undo_next_lsn (already undone span skipped)
//!   anything else → continue at prev_lsn
//! ```

use std::collections::{BinaryHeap, HashMap};

use parking_lot::Mutex;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::op::{CodecRegistry, Payload, Undoable};
use crate::storage::{LatchTable, ResourceRef, ResourceStore};
use crate::txn::{TransactionContext, TxnId, TxnState};
use crate::wal::{LogManager, LogRecord, RecordKind};
use crate::AtlasError;

/// Outcome of undoing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoStep {
    /// A compensation was logged (at `clr`) and applied
    Compensated { clr: Lsn, next: Option<Lsn> },

    /// Nothing to undo here; the walk moves on
    Skipped { next: Option<Lsn> },
}

impl UndoStep {
    /// Next record of the chain to visit
    pub fn next(self) -> Option<Lsn> {
        match self {
            UndoStep::Compensated { next, .. } | UndoStep::Skipped { next } => next,
        }
    }
}

/// Resource → first LSN that dirtied it since the last flush
pub type DirtyTable = Mutex<HashMap<ResourceRef, Lsn>>;

/// Rolls back transactions against one log and one resource store
pub struct Undoer<'a, S: ResourceStore + ?Sized> {
    log: &'a LogManager,
    store: &'a S,
    latches: &'a LatchTable,
    codecs: &'a CodecRegistry,

    /// Live engines track resources compensations dirty again
    dirty: Option<&'a DirtyTable>,
}

impl<'a, S: ResourceStore + ?Sized> Undoer<'a, S> {
    pub fn new(
        log: &'a LogManager,
        store: &'a S,
        latches: &'a LatchTable,
        codecs: &'a CodecRegistry,
    ) -> Self {
        Self {
            log,
            store,
            latches,
            codecs,
            dirty: None,
        }
    }

    /// Record every compensated resource in `dirty`
    pub fn tracking_dirty(mut self, dirty: &'a DirtyTable) -> Self {
        self.dirty = Some(dirty);
        self
    }

    /// Undo the record at `lsn`, which must belong to `ctx`
    pub fn undo_step(&self, ctx: &mut TransactionContext, lsn: Lsn) -> Result<UndoStep> {
        let record = self.log.read_record(lsn)?;
        if record.txn_id != ctx.id() {
            return Err(AtlasError::LogCorruption {
                offset: 0,
                reason: format!(
                    "chain of transaction {} reaches record {} owned by {}",
                    ctx.id(),
                    lsn,
                    record.txn_id
                ),
            });
        }

        match record.kind {
            RecordKind::Normal => self.compensate(ctx, record),
            RecordKind::Compensation => {
                tracing::debug!(
                    txn = ctx.id(),
                    lsn = %lsn,
                    undo_next = ?record.undo_next_lsn,
                    "skipping compensated span"
                );
                Ok(UndoStep::Skipped {
                    next: record.undo_next_lsn,
                })
            }
            RecordKind::Commit | RecordKind::AbortComplete | RecordKind::Checkpoint => {
                Ok(UndoStep::Skipped {
                    next: record.prev_lsn,
                })
            }
        }
    }

    /// Walk `ctx`'s chain to its start, then log its completion
    ///
    /// Returns the LSN of the abort-complete record, once it is durable.
    /// `ctx` must already be in the Aborting state.
    pub fn rollback(&self, ctx: &mut TransactionContext) -> Result<Lsn> {
        let mut next = ctx.last_lsn();
        while let Some(lsn) = next {
            next = self.undo_step(ctx, lsn)?.next();
        }

        let done = self.finish(ctx)?;
        self.log.flush(done)?;
        Ok(done)
    }

    /// Append the abort-complete record and mark the transaction Aborted
    pub fn finish(&self, ctx: &mut TransactionContext) -> Result<Lsn> {
        let lsn = self
            .log
            .append(LogRecord::abort_complete(ctx.id(), ctx.last_lsn()))?;
        ctx.record_append(lsn);
        ctx.transition(TxnState::Aborted)?;
        tracing::debug!(txn = ctx.id(), lsn = %lsn, "transaction rolled back");
        Ok(lsn)
    }

    fn compensate(&self, ctx: &mut TransactionContext, record: LogRecord) -> Result<UndoStep> {
        let payload = self.codecs.decode(record.op_code, &record.payload)?;
        let Some(op) = payload.as_undoable() else {
            // Redo-only change: nothing to reverse
            return Ok(UndoStep::Skipped {
                next: record.prev_lsn,
            });
        };
        let resource = record.resource.ok_or_else(|| AtlasError::LogCorruption {
            offset: 0,
            reason: format!("undoable record {} names no resource", record.lsn),
        })?;

        let clr = Payload::Compensation(op.generate_undo(record.lsn));
        let (_, bytes) = self.codecs.encode(&clr)?;

        let _latch = self.latches.acquire(&resource);
        let clr_lsn = self.log.append(LogRecord::compensation(
            ctx.id(),
            ctx.last_lsn(),
            resource.clone(),
            record.prev_lsn,
            bytes,
        ))?;
        ctx.record_append(clr_lsn);
        if let Some(dirty) = self.dirty {
            dirty.lock().entry(resource.clone()).or_insert(clr_lsn);
        }

        clr.apply_redo(clr_lsn, &resource, self.store)
            .map_err(|e| AtlasError::UndoApplication {
                lsn: record.lsn,
                reason: e.to_string(),
            })?;

        tracing::debug!(
            txn = ctx.id(),
            undone = %record.lsn,
            clr = %clr_lsn,
            undo_next = ?record.prev_lsn,
            "compensated"
        );
        Ok(UndoStep::Compensated {
            clr: clr_lsn,
            next: record.prev_lsn,
        })
    }
}

/// Counters reported by the recovery undo pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoStats {
    /// Transactions rolled back, by id
    pub aborted: Vec<TxnId>,

    /// Compensation records written
    pub compensations: u64,
}

/// Roll back every loser, always undoing the newest outstanding record first
pub fn undo_losers<S>(undoer: &Undoer<'_, S>, losers: Vec<TransactionContext>) -> Result<UndoStats>
where
    S: ResourceStore + ?Sized,
{
    let mut stats = UndoStats::default();
    let mut contexts: HashMap<TxnId, TransactionContext> = HashMap::new();
    let mut to_undo = BinaryHeap::new();

    for mut ctx in losers {
        if ctx.state() == TxnState::Active {
            ctx.transition(TxnState::Aborting)?;
        }
        match ctx.last_lsn() {
            Some(lsn) => to_undo.push((lsn, ctx.id())),
            None => {
                undoer.finish(&mut ctx)?;
                stats.aborted.push(ctx.id());
            }
        }
        contexts.insert(ctx.id(), ctx);
    }

    while let Some((lsn, txn_id)) = to_undo.pop() {
        let ctx = contexts
            .get_mut(&txn_id)
            .ok_or_else(|| AtlasError::Transaction(format!("unknown loser {}", txn_id)))?;

        let step = undoer.undo_step(ctx, lsn)?;
        if let UndoStep::Compensated { .. } = step {
            stats.compensations += 1;
        }
        match step.next() {
            Some(next) => to_undo.push((next, txn_id)),
            None => {
                undoer.finish(ctx)?;
                stats.aborted.push(txn_id);
            }
        }
    }

    undoer.log.flush_all()?;
    stats.aborted.sort_unstable();

    tracing::info!(
        aborted = stats.aborted.len(),
        compensations = stats.compensations,
        "undo pass complete"
    );
    Ok(stats)
}
