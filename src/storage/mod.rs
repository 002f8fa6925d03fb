//! Storage Module
//!
//! The resource-state boundary between the recovery core and the storage
//! collaborator that owns pages.
//!
//! ## Responsibilities
//! - Identify mutated resources with an opaque `ResourceRef`
//! - Read a resource's version (page LSN) and image
//! - Write a new image stamped with the LSN that produced it
//! - Flush resources to stable storage (only after the log covers them)
//!
//! The log layer never interprets a resource's bytes. It only compares the
//! resource version against record LSNs to decide whether redo is needed.

mod file;
mod latch;
mod memory;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lsn::Lsn;

pub use file::FileStore;
pub use latch::{LatchGuard, LatchTable};
pub use memory::MemoryStore;

/// Opaque locator of a mutated page or object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef(Vec<u8>);

impl ResourceRef {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Page id + slot locator: [page_id (8 BE)][slot (2 BE)]
    pub fn page(page_id: u64, slot: u16) -> Self {
        let mut bytes = Vec::with_capacity(10);
        bytes.extend_from_slice(&page_id.to_be_bytes());
        bytes.extend_from_slice(&slot.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Current state of a resource as seen by the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceState {
    /// LSN of the last record applied to this resource (None = never written)
    pub version: Option<Lsn>,

    /// Resource contents (None = not allocated)
    pub image: Option<Vec<u8>>,
}

impl ResourceState {
    /// A resource that has never been written
    pub fn absent() -> Self {
        Self::default()
    }

    /// Whether a record with this LSN is newer than the resource
    pub fn is_older_than(&self, lsn: Lsn) -> bool {
        match self.version {
            Some(version) => version < lsn,
            None => true,
        }
    }
}

/// Resource-state reader/writer supplied by the storage collaborator
///
/// `write_state` only changes the in-memory (volatile) copy. Durability comes
/// from `flush`/`flush_all`, which the engine calls only after the log is
/// durable up to the resource version.
pub trait ResourceStore: Send + Sync {
    /// Read the current version and image of a resource
    fn read_state(&self, resource: &ResourceRef) -> Result<ResourceState>;

    /// Replace a resource's image and stamp it with `version`
    fn write_state(&self, resource: &ResourceRef, version: Lsn, image: Option<&[u8]>)
        -> Result<()>;

    /// Make one resource's current state durable
    fn flush(&self, resource: &ResourceRef) -> Result<()>;

    /// Make every resource's current state durable
    fn flush_all(&self) -> Result<()>;
}

impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    fn read_state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        (**self).read_state(resource)
    }

    fn write_state(
        &self,
        resource: &ResourceRef,
        version: Lsn,
        image: Option<&[u8]>,
    ) -> Result<()> {
        (**self).write_state(resource, version, image)
    }

    fn flush(&self, resource: &ResourceRef) -> Result<()> {
        (**self).flush(resource)
    }

    fn flush_all(&self) -> Result<()> {
        (**self).flush_all()
    }
}
