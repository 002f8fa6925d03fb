//! Undoable operations on a resource

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};
use crate::lsn::Lsn;
use crate::storage::ResourceState;

use super::{splice, Compensation, CompensationAction, Loggable, OpCode, Undoable};

/// Operations that can be logged and undone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Overwrite a byte range (with old bytes for rollback)
    Update {
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },

    /// Allocate a zeroed resource of `size` bytes
    Allocate { size: u32 },

    /// Free a resource (with its last image for rollback)
    Deallocate { before: Vec<u8> },
}

impl Operation {
    pub fn update(offset: u32, before: impl Into<Vec<u8>>, after: impl Into<Vec<u8>>) -> Self {
        Operation::Update {
            offset,
            before: before.into(),
            after: after.into(),
        }
    }

    /// Check that this operation can be undone exactly against `current`
    ///
    /// Rollback restores whatever the operation recorded as its before
    /// image, so that image has to be what the resource really holds.
    pub fn validate(&self, current: &ResourceState) -> Result<()> {
        match self {
            Operation::Update {
                offset,
                before,
                after,
            } => {
                let image = current
                    .image
                    .as_deref()
                    .ok_or_else(|| invalid("update of an unallocated resource"))?;
                if before.len() != after.len() {
                    return Err(invalid(format!(
                        "before is {} bytes but after is {}",
                        before.len(),
                        after.len()
                    )));
                }
                let start = *offset as usize;
                let end = start
                    .checked_add(after.len())
                    .filter(|end| *end <= image.len())
                    .ok_or_else(|| {
                        invalid(format!(
                            "range {}..{} is outside a {}-byte resource",
                            start,
                            start.saturating_add(after.len()),
                            image.len()
                        ))
                    })?;
                if image[start..end] != before[..] {
                    return Err(invalid(format!(
                        "before does not match the bytes at {}..{}",
                        start, end
                    )));
                }
                Ok(())
            }
            Operation::Allocate { .. } => match current.image {
                Some(_) => Err(invalid("resource is already allocated")),
                None => Ok(()),
            },
            Operation::Deallocate { before } => match current.image.as_deref() {
                None => Err(invalid("deallocate of an unallocated resource")),
                Some(image) if image != &before[..] => {
                    Err(invalid("before does not match the resource image"))
                }
                Some(_) => Ok(()),
            },
        }
    }
}

fn invalid(reason: impl Into<String>) -> AtlasError {
    AtlasError::InvalidOperation(reason.into())
}

impl Loggable for Operation {
    fn op_code(&self) -> OpCode {
        match self {
            Operation::Update { .. } => OpCode::UPDATE,
            Operation::Allocate { .. } => OpCode::ALLOCATE,
            Operation::Deallocate { .. } => OpCode::DEALLOCATE,
        }
    }

    fn redo_image(&self, current: &ResourceState) -> Option<Vec<u8>> {
        match self {
            Operation::Update { offset, after, .. } => {
                Some(splice(current.image.as_deref(), *offset, after))
            }
            Operation::Allocate { size } => Some(vec![0u8; *size as usize]),
            Operation::Deallocate { .. } => None,
        }
    }
}

impl Undoable for Operation {
    fn generate_undo(&self, lsn: Lsn) -> Compensation {
        let action = match self {
            Operation::Update { offset, before, .. } => CompensationAction::Restore {
                offset: *offset,
                bytes: before.clone(),
            },
            Operation::Allocate { .. } => CompensationAction::Release,
            Operation::Deallocate { before } => CompensationAction::Reinstate {
                image: before.clone(),
            },
        };
        Compensation::new(action, lsn)
    }
}
