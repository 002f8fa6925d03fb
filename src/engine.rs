//! Engine Module
//!
//! The transactional facade that coordinates the log, the transaction table
//! and the resource store.
//!
//! ## Responsibilities
//! - Run recovery before accepting any transaction
//! - Log every change before applying it (write-ahead)
//! - Make commits durable before acknowledging them
//! - Roll back aborted transactions with compensation records
//! - Take checkpoints to bound the next recovery
//! - Refuse all work after a fatal failure

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::Result;
use crate::lsn::Lsn;
use crate::op::{CodecRegistry, Operation, Payload};
use crate::recovery::{
    write_master, CheckpointData, DirtyTable, RecoveryManager, RecoveryReport, Undoer,
};
use crate::storage::{LatchTable, ResourceRef, ResourceStore};
use crate::txn::{TransactionTable, TxnId, TxnState};
use crate::wal::{LogManager, LogRecord};
use crate::AtlasError;

/// The recovery-aware transactional engine
///
/// ## Concurrency Model
///
/// - **Appends**: serialized inside the `LogManager` (one append lock)
/// - **Resources**: each apply holds that resource's latch from append to
///   apply, so a resource sees its changes in LSN order
/// - **Transactions**: one context mutex per transaction; a transaction's
///   own calls never interleave
/// - **Checkpoints**: `checkpoint_gate` is read-locked by log/commit/abort
///   and write-locked by `checkpoint`, so a checkpoint sees no change in
///   flight
///
/// Lock order: gate → transaction → latch → log tail.
pub struct Engine<S: ResourceStore> {
    /// Engine configuration
    config: Config,

    /// Write-ahead log
    log: LogManager,

    /// Storage collaborator holding resource images
    store: S,

    /// Short-term per-resource latches
    latches: LatchTable,

    /// Payload codecs keyed by operation code
    codecs: CodecRegistry,

    /// Transactions whose outcome is not durable yet
    txns: TransactionTable,

    /// Resources changed since they were last flushed
    dirty: DirtyTable,

    /// Keeps checkpoints from observing half-done changes
    checkpoint_gate: RwLock<()>,

    /// Set by a fatal failure; every later call fails
    halted: AtomicBool,

    /// Log size when the last checkpoint finished
    bytes_at_checkpoint: AtomicU64,

    /// What recovery did when this engine was opened
    last_recovery: RecoveryReport,
}

impl<S: ResourceStore> Engine<S> {
    /// Open or create an engine with the built-in payload codecs
    ///
    /// On startup:
    /// 1. Open/create data directory
    /// 2. Open the log (torn tail truncated)
    /// 3. Run analysis, redo and undo
    /// 4. Checkpoint the recovered state
    pub fn open(config: Config, store: S) -> Result<Self> {
        Self::open_with_codecs(config, store, CodecRegistry::builtin())
    }

    /// Open with a caller-supplied codec registry
    pub fn open_with_codecs(config: Config, store: S, codecs: CodecRegistry) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let log = LogManager::open(&config.wal_path(), config.wal_sync_strategy)?;
        let latches = LatchTable::new();

        let report = RecoveryManager::new(&log, &store, &latches, &codecs, &config.master_path())
            .with_redo_workers(config.redo_workers)
            .recover()?;

        let engine = Self {
            txns: TransactionTable::starting_at(report.next_txn_id),
            bytes_at_checkpoint: AtomicU64::new(log.end_offset()),
            config,
            log,
            store,
            latches,
            codecs,
            dirty: Mutex::new(HashMap::new()),
            checkpoint_gate: RwLock::new(()),
            halted: AtomicBool::new(false),
            last_recovery: report,
        };

        // Recovered state becomes the new starting point
        engine.checkpoint()?;

        tracing::info!(
            data_dir = %engine.config.data_dir.display(),
            next_lsn = %engine.log.next_lsn(),
            "engine opened"
        );
        Ok(engine)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction
    pub fn begin_transaction(&self) -> Result<TxnId> {
        self.ensure_running()?;
        let txn = self.txns.begin();
        tracing::trace!(txn, "transaction started");
        Ok(txn)
    }

    /// Log `op` on behalf of `txn`, then apply it to `resource`
    ///
    /// Returns the LSN of the new record. An operation whose before image
    /// disagrees with the resource is rejected with `InvalidOperation`
    /// and nothing is logged.
    pub fn log(&self, txn: TxnId, resource: &ResourceRef, op: Operation) -> Result<Lsn> {
        self.ensure_running()?;
        let _gate = self.checkpoint_gate.read();

        let handle = self.txns.get(txn)?;
        let mut ctx = handle.lock();
        ctx.ensure_active()?;

        let _latch = self.latches.acquire(resource);

        // Checked under the latch so the before image cannot go stale
        // between validation and append
        let current = self.store.read_state(resource)?;
        op.validate(&current)?;

        let payload = Payload::Operation(op);
        let (op_code, bytes) = self.codecs.encode(&payload)?;

        let lsn = self
            .log
            .append(LogRecord::normal(txn, ctx.last_lsn(), resource.clone(), op_code, bytes))
            .map_err(|e| self.halt(e))?;
        ctx.record_append(lsn);
        self.dirty.lock().entry(resource.clone()).or_insert(lsn);

        // The log already says this happened; a resource that disagrees
        // can only be repaired by recovery
        payload
            .apply_redo(lsn, resource, &self.store)
            .map_err(|e| self.halt(e))?;

        Ok(lsn)
    }

    /// Commit `txn`; returns once the commit record is durable
    pub fn commit(&self, txn: TxnId) -> Result<Lsn> {
        self.ensure_running()?;
        let lsn = {
            let _gate = self.checkpoint_gate.read();
            let handle = self.txns.get(txn)?;
            let mut ctx = handle.lock();
            ctx.ensure_active()?;

            let lsn = self
                .log
                .append(LogRecord::commit(txn, ctx.last_lsn()))
                .map_err(|e| self.halt(e))?;
            ctx.record_append(lsn);
            self.log.flush(lsn).map_err(|e| self.halt(e))?;
            ctx.transition(TxnState::Committed)?;
            lsn
        };

        self.txns.remove(txn);
        tracing::debug!(txn, lsn = %lsn, "transaction committed");

        self.maybe_checkpoint();
        Ok(lsn)
    }

    /// Roll `txn` back completely
    ///
    /// Returns the LSN of the abort-complete record. Any failure after the
    /// rollback started halts the engine: a half-undone transaction is only
    /// safe to finish through recovery.
    pub fn abort(&self, txn: TxnId) -> Result<Lsn> {
        self.ensure_running()?;
        let lsn = {
            let _gate = self.checkpoint_gate.read();
            let handle = self.txns.get(txn)?;
            let mut ctx = handle.lock();
            ctx.transition(TxnState::Aborting)?;

            Undoer::new(&self.log, &self.store, &self.latches, &self.codecs)
                .tracking_dirty(&self.dirty)
                .rollback(&mut ctx)
                .map_err(|e| self.halt(e))?
        };

        self.txns.remove(txn);
        tracing::debug!(txn, lsn = %lsn, "transaction aborted");

        self.maybe_checkpoint();
        Ok(lsn)
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Make every record up to `lsn` durable
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        self.ensure_running()?;
        self.log.flush(lsn).map_err(|e| {
            if e.is_fatal() {
                self.halt(e)
            } else {
                e
            }
        })
    }

    /// Write one resource back to durable storage
    ///
    /// The log is flushed up to the resource version first, so the durable
    /// copy never gets ahead of the records describing it.
    pub fn flush_resource(&self, resource: &ResourceRef) -> Result<()> {
        self.ensure_running()?;
        let _latch = self.latches.acquire(resource);

        let state = self.store.read_state(resource)?;
        if let Some(version) = state.version {
            self.log.flush(version).map_err(|e| self.halt(e))?;
        }
        self.store.flush(resource)?;
        self.dirty.lock().remove(resource);

        tracing::trace!(resource = %resource, version = ?state.version, "resource flushed");
        Ok(())
    }

    /// Take a checkpoint
    ///
    /// Waits for in-flight changes, flushes the log and every resource, then
    /// logs the transaction and dirty tables and points the master at the
    /// new record.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.ensure_running()?;
        let _gate = self.checkpoint_gate.write();

        self.log.flush_all().map_err(|e| self.halt(e))?;
        self.store.flush_all()?;

        // Every resource was just written back
        self.dirty.lock().clear();
        let data = CheckpointData {
            active_txns: self.txns.snapshot(),
            dirty_resources: Vec::new(),
            next_txn_id: self.txns.next_id(),
        };
        let active = data.active_txns.len();

        let (_, bytes) = self.codecs.encode(&Payload::Checkpoint(data))?;
        let lsn = self
            .log
            .append(LogRecord::checkpoint(bytes))
            .map_err(|e| self.halt(e))?;
        self.log.flush(lsn).map_err(|e| self.halt(e))?;
        write_master(&self.config.master_path(), lsn)?;

        self.bytes_at_checkpoint
            .store(self.log.end_offset(), Ordering::SeqCst);
        tracing::info!(lsn = %lsn, active, "checkpoint complete");
        Ok(lsn)
    }

    /// Checkpoint and shut down
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        tracing::info!(last_lsn = ?self.log.last_lsn(), "engine closed");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The underlying log, for inspection
    pub fn log_manager(&self) -> &LogManager {
        &self.log
    }

    /// Highest LSN known to be on stable storage
    pub fn durable_lsn(&self) -> Option<Lsn> {
        self.log.durable_lsn()
    }

    /// What recovery did when this engine was opened
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.last_recovery
    }

    /// State of a live transaction; None once it was evicted
    pub fn transaction_state(&self, txn: TxnId) -> Option<TxnState> {
        self.txns.get(txn).ok().map(|handle| handle.lock().state())
    }

    /// Ids of transactions with an undecided outcome
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.txns.ids()
    }

    /// Resources changed since they were last flushed, by first dirtying LSN
    pub fn dirty_resources(&self) -> Vec<(ResourceRef, Lsn)> {
        let mut entries: Vec<_> = self
            .dirty
            .lock()
            .iter()
            .map(|(res, lsn)| (res.clone(), *lsn))
            .collect();
        entries.sort_unstable_by_key(|(_, lsn)| *lsn);
        entries
    }

    /// Whether a fatal failure stopped the engine
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            return Err(AtlasError::EngineHalted);
        }
        Ok(())
    }

    /// Stop accepting work; the next open runs recovery
    fn halt(&self, err: AtlasError) -> AtlasError {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(error = %err, "engine halted");
        }
        err
    }

    fn maybe_checkpoint(&self) {
        let threshold = self.config.checkpoint_threshold_bytes;
        if threshold == 0 {
            return;
        }

        let written = self
            .log
            .end_offset()
            .saturating_sub(self.bytes_at_checkpoint.load(Ordering::SeqCst));
        if written < threshold {
            return;
        }

        if let Err(e) = self.checkpoint() {
            tracing::warn!(error = %e, "automatic checkpoint failed");
        }
    }
}
