//! Redo Pass
//!
//! Repeats history: every change in the log that a resource does not yet
//! reflect is reapplied, whatever the fate of its transaction. Losers are
//! rolled back afterwards, on top of the reconstructed state.
//!
//! ## Ordering
//! Redo only needs per-resource order. With more than one worker, records
//! are routed by a hash of their resource, so all records of one resource
//! go through one worker's queue in LSN order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crossbeam::channel;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::op::{CodecRegistry, Payload};
use crate::storage::{LatchTable, ResourceRef, ResourceStore};
use crate::wal::{LogManager, LogRecord, RecordKind};
use crate::AtlasError;

use super::analysis::Analysis;

/// Records each worker may have queued before the scan blocks
const REDO_QUEUE_DEPTH: usize = 1024;

/// Counters reported by the redo pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoStats {
    /// Records reapplied to their resource
    pub redone: u64,

    /// Records the resource already reflected, or that carry no change
    pub skipped: u64,
}

/// One change routed to a redo worker
struct RedoTask {
    lsn: Lsn,
    resource: ResourceRef,
    payload: Payload,
}

/// Run the redo pass from the analysis' redo start to the end of the log
pub fn redo<S>(
    log: &LogManager,
    store: &S,
    latches: &LatchTable,
    codecs: &CodecRegistry,
    analysis: &Analysis,
    workers: usize,
) -> Result<RedoStats>
where
    S: ResourceStore + ?Sized,
{
    let Some(start) = analysis.redo_start() else {
        tracing::info!("redo pass skipped: no dirty resources");
        return Ok(RedoStats::default());
    };

    let stats = if workers <= 1 {
        redo_sequential(log, store, latches, codecs, analysis, start)?
    } else {
        redo_parallel(log, store, latches, codecs, analysis, start, workers)?
    };

    tracing::info!(
        start = %start,
        redone = stats.redone,
        skipped = stats.skipped,
        workers,
        "redo pass complete"
    );
    Ok(stats)
}

fn redo_sequential<S>(
    log: &LogManager,
    store: &S,
    latches: &LatchTable,
    codecs: &CodecRegistry,
    analysis: &Analysis,
    start: Lsn,
) -> Result<RedoStats>
where
    S: ResourceStore + ?Sized,
{
    let mut stats = RedoStats::default();
    for record in log.scan_forward(start)? {
        match candidate(record?, codecs, analysis)? {
            Some(task) => {
                if apply(store, latches, &task)? {
                    stats.redone += 1;
                } else {
                    stats.skipped += 1;
                }
            }
            None => stats.skipped += 1,
        }
    }
    Ok(stats)
}

fn redo_parallel<S>(
    log: &LogManager,
    store: &S,
    latches: &LatchTable,
    codecs: &CodecRegistry,
    analysis: &Analysis,
    start: Lsn,
    workers: usize,
) -> Result<RedoStats>
where
    S: ResourceStore + ?Sized,
{
    let outcome = crossbeam::thread::scope(|scope| -> Result<RedoStats> {
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for _ in 0..workers {
            let (tx, rx) = channel::bounded::<RedoTask>(REDO_QUEUE_DEPTH);
            senders.push(tx);
            handles.push(scope.spawn(move |_| -> Result<RedoStats> {
                let mut stats = RedoStats::default();
                for task in rx {
                    if apply(store, latches, &task)? {
                        stats.redone += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                Ok(stats)
            }));
        }

        // Scan on this thread and route each change to its resource's worker
        let mut dispatched = Ok(RedoStats::default());
        let mut skipped = 0;
        let scan = log.scan_forward(start);
        match scan {
            Ok(scan) => {
                for record in scan {
                    let task = match record.and_then(|r| candidate(r, codecs, analysis)) {
                        Ok(Some(task)) => task,
                        Ok(None) => {
                            skipped += 1;
                            continue;
                        }
                        Err(e) => {
                            dispatched = Err(e);
                            break;
                        }
                    };
                    let worker = partition(&task.resource, workers);
                    // A closed queue means that worker failed; its error is
                    // collected below
                    if senders[worker].send(task).is_err() {
                        break;
                    }
                }
            }
            Err(e) => dispatched = Err(e),
        }
        drop(senders);

        let mut total = RedoStats {
            redone: 0,
            skipped,
        };
        let mut first_error = dispatched.err();
        for handle in handles {
            match handle.join() {
                Ok(Ok(stats)) => {
                    total.redone += stats.redone;
                    total.skipped += stats.skipped;
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error
                        .get_or_insert(AtlasError::Storage("redo worker panicked".to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    });

    outcome.map_err(|_| AtlasError::Storage("redo worker panicked".to_string()))?
}

/// The change a record asks redo to consider, if any
fn candidate(
    record: LogRecord,
    codecs: &CodecRegistry,
    analysis: &Analysis,
) -> Result<Option<RedoTask>> {
    if !matches!(record.kind, RecordKind::Normal | RecordKind::Compensation) {
        return Ok(None);
    }
    let Some(resource) = record.resource else {
        return Ok(None);
    };

    // Changes older than the resource's rec_lsn were on disk at the checkpoint
    match analysis.dirty.get(&resource) {
        Some(rec_lsn) if record.lsn >= *rec_lsn => {}
        _ => return Ok(None),
    }

    let payload = codecs.decode(record.op_code, &record.payload)?;
    Ok(Some(RedoTask {
        lsn: record.lsn,
        resource,
        payload,
    }))
}

/// Apply one change under the resource's latch
fn apply<S>(store: &S, latches: &LatchTable, task: &RedoTask) -> Result<bool>
where
    S: ResourceStore + ?Sized,
{
    let _latch = latches.acquire(&task.resource);
    let applied = task.payload.apply_redo(task.lsn, &task.resource, store)?;
    tracing::debug!(
        lsn = %task.lsn,
        resource = %task.resource,
        applied,
        "redo"
    );
    Ok(applied)
}

fn partition(resource: &ResourceRef, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    resource.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
