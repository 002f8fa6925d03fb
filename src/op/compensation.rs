//! Compensation payloads
//!
//! A compensation is loggable but not undoable. It is paired with the
//! operation it reverses exactly once, when that operation generates it, and
//! the pairing never changes afterwards. Only the codec can rebuild one
//! from bytes; nothing else can construct or deserialize a compensation.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::storage::ResourceState;

use super::{splice, Loggable, OpCode};

/// Physical effect of a compensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationAction {
    /// Put back the bytes an update overwrote
    Restore { offset: u32, bytes: Vec<u8> },

    /// Free a resource an allocation created
    Release,

    /// Bring back a resource a deallocation freed
    Reinstate { image: Vec<u8> },
}

/// Reversal of one undoable operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    action: CompensationAction,

    /// LSN of the operation this compensates
    undo_op: Lsn,
}

impl Compensation {
    pub(super) fn new(action: CompensationAction, undo_op: Lsn) -> Self {
        Self { action, undo_op }
    }

    /// Wire form: the action followed by the compensated LSN
    pub(super) fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(&self.action, self.undo_op))?)
    }

    pub(super) fn decode(bytes: &[u8]) -> Result<Self> {
        let (action, undo_op): (CompensationAction, Lsn) = bincode::deserialize(bytes)?;
        Ok(Self::new(action, undo_op))
    }

    pub fn action(&self) -> &CompensationAction {
        &self.action
    }

    /// LSN of the compensated operation
    pub fn undo_op(&self) -> Lsn {
        self.undo_op
    }
}

impl Loggable for Compensation {
    fn op_code(&self) -> OpCode {
        OpCode::COMPENSATION
    }

    fn redo_image(&self, current: &ResourceState) -> Option<Vec<u8>> {
        match &self.action {
            CompensationAction::Restore { offset, bytes } => {
                Some(splice(current.image.as_deref(), *offset, bytes))
            }
            CompensationAction::Release => None,
            CompensationAction::Reinstate { image } => Some(image.clone()),
        }
    }
}
