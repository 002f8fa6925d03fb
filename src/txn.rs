//! Transaction Contexts
//!
//! Tracks each live transaction's state and the head of its backward-linked
//! log chain. A context is created by `begin`, advanced on every append, and
//! evicted only once its outcome (commit or abort-complete) is durable.
//!
//! ## State Machine
//! ```text
//!   Active ──commit──► Committed
//!     │
//!     └──abort──► Aborting ──chain undone──► Aborted
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::AtlasError;

/// Transaction identifier
pub type TxnId = u64;

/// Reserved for records that belong to no transaction (checkpoints)
pub const NON_TRANSACTIONAL: TxnId = 0;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Aborting,
    Committed,
    Aborted,
}

impl TxnState {
    /// Whether the outcome is final
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Active => "active",
            TxnState::Aborting => "aborting",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Per-transaction bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    id: TxnId,
    state: TxnState,

    /// Head of the chain; the next record's `prev_lsn`
    last_lsn: Option<Lsn>,
}

impl TransactionContext {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TxnState::Active,
            last_lsn: None,
        }
    }

    /// Context rebuilt by recovery for a transaction found in the log
    pub fn recovered(id: TxnId, state: TxnState, last_lsn: Option<Lsn>) -> Self {
        Self {
            id,
            state,
            last_lsn,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// Record that `lsn` was appended on behalf of this transaction
    pub fn record_append(&mut self, lsn: Lsn) {
        debug_assert!(self.last_lsn.map_or(true, |last| last < lsn));
        self.last_lsn = Some(lsn);
    }

    /// Fail unless the transaction may still log changes
    pub fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(AtlasError::Transaction(format!(
                "transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: TxnState) -> Result<()> {
        let allowed = matches!(
            (self.state, next),
            (TxnState::Active, TxnState::Committed)
                | (TxnState::Active, TxnState::Aborting)
                | (TxnState::Aborting, TxnState::Aborting)
                | (TxnState::Aborting, TxnState::Aborted)
        );
        if !allowed {
            return Err(AtlasError::Transaction(format!(
                "transaction {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Shared handle to one transaction's context
pub type TxnHandle = Arc<Mutex<TransactionContext>>;

/// Table of transactions whose outcome is not yet durable
pub struct TransactionTable {
    next_id: AtomicU64,
    active: RwLock<HashMap<TxnId, TxnHandle>>,
}

impl TransactionTable {
    /// Table handing out ids from `next_id` on
    pub fn starting_at(next_id: TxnId) -> Self {
        Self {
            next_id: AtomicU64::new(next_id.max(NON_TRANSACTIONAL + 1)),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Start a new transaction
    pub fn begin(&self) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active
            .write()
            .insert(id, Arc::new(Mutex::new(TransactionContext::new(id))));
        id
    }

    /// Re-register a context found by recovery
    pub fn adopt(&self, ctx: TransactionContext) -> TxnHandle {
        let id = ctx.id();
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        let handle = Arc::new(Mutex::new(ctx));
        self.active.write().insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: TxnId) -> Result<TxnHandle> {
        self.active
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| AtlasError::Transaction(format!("unknown transaction {}", id)))
    }

    /// Evict a transaction whose outcome is durable
    pub fn remove(&self, id: TxnId) -> Option<TxnHandle> {
        self.active.write().remove(&id)
    }

    /// `(id, last_lsn)` of every transaction that has logged something
    pub fn snapshot(&self) -> Vec<(TxnId, Lsn)> {
        let mut entries: Vec<_> = self
            .active
            .read()
            .values()
            .filter_map(|handle| {
                let ctx = handle.lock();
                ctx.last_lsn().map(|lsn| (ctx.id(), lsn))
            })
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<_> = self.active.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Id the next `begin` will return
    pub fn next_id(&self) -> TxnId {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
