//! Analysis Pass
//!
//! Rebuilds, purely from the log, which transactions were undecided at the
//! crash and which resources might be missing changes.

use std::collections::HashMap;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::op::{CodecRegistry, OpCode, Payload};
use crate::storage::ResourceRef;
use crate::txn::{TxnId, TxnState, NON_TRANSACTIONAL};
use crate::wal::{LogManager, RecordKind};
use crate::AtlasError;

/// A transaction as reconstructed from the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnEntry {
    pub state: TxnState,
    pub last_lsn: Lsn,
}

/// Terminal output of the analysis pass
#[derive(Debug, Default)]
pub struct Analysis {
    /// Checkpoint the scan started from
    pub checkpoint_lsn: Option<Lsn>,

    /// Every transaction seen since the checkpoint (or in the checkpoint)
    pub txns: HashMap<TxnId, TxnEntry>,

    /// Resource → earliest LSN that might need redo
    pub dirty: HashMap<ResourceRef, Lsn>,

    /// Records read by the scan
    pub records: u64,

    /// First transaction id that was never used
    pub next_txn_id: TxnId,
}

impl Analysis {
    /// Where redo starts: the smallest rec_lsn in the dirty table
    pub fn redo_start(&self) -> Option<Lsn> {
        self.dirty.values().min().copied()
    }

    /// Transactions without a commit or abort-complete record, by id
    pub fn losers(&self) -> Vec<(TxnId, TxnEntry)> {
        let mut losers: Vec<_> = self
            .txns
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal())
            .map(|(id, entry)| (*id, *entry))
            .collect();
        losers.sort_unstable_by_key(|(id, _)| *id);
        losers
    }
}

/// Run the analysis pass
///
/// Scans forward from `checkpoint` (or the log start) to the end of the log.
pub fn analyze(
    log: &LogManager,
    codecs: &CodecRegistry,
    checkpoint: Option<Lsn>,
) -> Result<Analysis> {
    let mut analysis = Analysis {
        checkpoint_lsn: checkpoint,
        next_txn_id: NON_TRANSACTIONAL + 1,
        ..Analysis::default()
    };

    if let Some(checkpoint_lsn) = checkpoint {
        seed_from_checkpoint(log, codecs, checkpoint_lsn, &mut analysis)?;
    }

    let start = checkpoint.unwrap_or(Lsn::FIRST);
    for record in log.scan_forward(start)? {
        let record = record?;
        analysis.records += 1;

        if record.kind == RecordKind::Checkpoint {
            continue;
        }
        analysis.next_txn_id = analysis.next_txn_id.max(record.txn_id + 1);

        let state = match record.kind {
            RecordKind::Normal => TxnState::Active,
            RecordKind::Compensation => TxnState::Aborting,
            RecordKind::Commit => TxnState::Committed,
            RecordKind::AbortComplete => TxnState::Aborted,
            RecordKind::Checkpoint => continue,
        };

        let entry = analysis.txns.entry(record.txn_id).or_insert(TxnEntry {
            state,
            last_lsn: record.lsn,
        });
        entry.last_lsn = record.lsn;
        // A compensation never turns an Aborting transaction back to Active
        if !(entry.state == TxnState::Aborting && state == TxnState::Active) {
            entry.state = state;
        }

        if let Some(resource) = record.resource {
            analysis.dirty.entry(resource).or_insert(record.lsn);
        }
    }

    tracing::info!(
        checkpoint = ?checkpoint,
        records = analysis.records,
        txns = analysis.txns.len(),
        dirty = analysis.dirty.len(),
        "analysis pass complete"
    );
    Ok(analysis)
}

fn seed_from_checkpoint(
    log: &LogManager,
    codecs: &CodecRegistry,
    checkpoint_lsn: Lsn,
    analysis: &mut Analysis,
) -> Result<()> {
    let record = log.read_record(checkpoint_lsn).map_err(|e| match e {
        AtlasError::RecordNotFound(lsn) => AtlasError::LogCorruption {
            offset: log.end_offset(),
            reason: format!("master points at checkpoint {} which is not in the log", lsn),
        },
        other => other,
    })?;

    if record.kind != RecordKind::Checkpoint {
        return Err(AtlasError::LogCorruption {
            offset: 0,
            reason: format!("record {} is {:?}, not a checkpoint", checkpoint_lsn, record.kind),
        });
    }

    let Payload::Checkpoint(data) = codecs.decode(OpCode::CHECKPOINT, &record.payload)? else {
        return Err(AtlasError::Serialization(format!(
            "checkpoint {} has no checkpoint payload",
            checkpoint_lsn
        )));
    };

    for (txn_id, last_lsn) in data.active_txns {
        analysis.txns.entry(txn_id).or_insert(TxnEntry {
            state: TxnState::Active,
            last_lsn,
        });
        analysis.next_txn_id = analysis.next_txn_id.max(txn_id + 1);
    }
    for (resource, rec_lsn) in data.dirty_resources {
        analysis.dirty.entry(resource).or_insert(rec_lsn);
    }
    analysis.next_txn_id = analysis.next_txn_id.max(data.next_txn_id);

    tracing::debug!(
        checkpoint = %checkpoint_lsn,
        txns = analysis.txns.len(),
        dirty = analysis.dirty.len(),
        "seeded analysis from checkpoint"
    );
    Ok(())
}
