//! Loggable Operations
//!
//! The unit of logging is a closed sum type. Each variant carries its own
//! payload and knows how to redo itself; undoable variants also produce the
//! compensation that reverses them.
//!
//! ## Capability Split
//! ```text
//!   Loggable  ── op_code / is_redo_needed / apply_redo
//!      ▲
//!      ├── Operation     (also Undoable: generate_undo → Compensation)
//!      └── Compensation  (Loggable only, never Undoable)
//! ```
//!
//! `Compensation` has no public constructor. The only way to obtain one is
//! [`Undoable::generate_undo`], and since `Compensation` does not implement
//! `Undoable`, undoing an undo does not type-check.

mod codec;
mod compensation;
mod operation;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::recovery::CheckpointData;
use crate::storage::{ResourceRef, ResourceState, ResourceStore};

pub use codec::{CodecRegistry, OpCode, PayloadCodec};
pub use compensation::{Compensation, CompensationAction};
pub use operation::Operation;

/// A self-describing change that can redo itself
pub trait Loggable {
    /// Code selecting the payload codec
    fn op_code(&self) -> OpCode;

    /// Whether the resource is older than the record with `lsn`
    fn is_redo_needed(&self, lsn: Lsn, current: &ResourceState) -> bool {
        current.is_older_than(lsn)
    }

    /// Image the resource holds after this change is applied on top of `current`
    fn redo_image(&self, current: &ResourceState) -> Option<Vec<u8>>;

    /// Reapply the change if the resource does not reflect it yet
    ///
    /// Returns whether anything was written. Applying the same record twice
    /// is a no-op the second time because the resource version already
    /// equals `lsn`.
    fn apply_redo<S>(&self, lsn: Lsn, resource: &ResourceRef, store: &S) -> Result<bool>
    where
        S: ResourceStore + ?Sized,
    {
        let current = store.read_state(resource)?;
        if !self.is_redo_needed(lsn, &current) {
            return Ok(false);
        }

        let image = self.redo_image(&current);
        store.write_state(resource, lsn, image.as_deref())?;
        Ok(true)
    }
}

/// A loggable change that can be reversed
pub trait Undoable: Loggable {
    /// Build the compensation reversing this change, which was logged at `lsn`
    fn generate_undo(&self, lsn: Lsn) -> Compensation;
}

/// Decoded payload of a log record
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// An undoable change to a resource
    Operation(Operation),

    /// The reversal of an earlier operation
    Compensation(Compensation),

    /// Active transaction and dirty resource tables
    Checkpoint(CheckpointData),

    /// Commit and abort-complete records carry nothing
    Empty,
}

impl Payload {
    pub fn op_code(&self) -> OpCode {
        match self {
            Payload::Operation(op) => op.op_code(),
            Payload::Compensation(clr) => clr.op_code(),
            Payload::Checkpoint(_) => OpCode::CHECKPOINT,
            Payload::Empty => OpCode::NONE,
        }
    }

    /// The undoable operation, if this payload is one
    pub fn as_undoable(&self) -> Option<&Operation> {
        match self {
            Payload::Operation(op) => Some(op),
            _ => None,
        }
    }

    /// Redo the payload against its resource; records without a resource
    /// effect are skipped
    pub fn apply_redo<S>(&self, lsn: Lsn, resource: &ResourceRef, store: &S) -> Result<bool>
    where
        S: ResourceStore + ?Sized,
    {
        match self {
            Payload::Operation(op) => op.apply_redo(lsn, resource, store),
            Payload::Compensation(clr) => clr.apply_redo(lsn, resource, store),
            Payload::Checkpoint(_) | Payload::Empty => Ok(false),
        }
    }
}

/// Overwrite `bytes` at `offset`, growing the image with zeros if needed
pub(crate) fn splice(base: Option<&[u8]>, offset: u32, bytes: &[u8]) -> Vec<u8> {
    let mut image = base.map(|b| b.to_vec()).unwrap_or_default();
    let start = offset as usize;
    let end = start + bytes.len();
    if image.len() < end {
        image.resize(end, 0);
    }
    image[start..end].copy_from_slice(bytes);
    image
}
