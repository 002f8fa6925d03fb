//! In-memory resource store
//!
//! Keeps a volatile and a durable copy of every resource so a crash can be
//! simulated by throwing the volatile copies away.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::lsn::Lsn;

use super::{ResourceRef, ResourceState, ResourceStore};

/// Resource store backed by two hash maps
#[derive(Default)]
pub struct MemoryStore {
    /// Current (buffer pool) state
    volatile: RwLock<HashMap<ResourceRef, ResourceState>>,

    /// State that would survive a crash
    durable: RwLock<HashMap<ResourceRef, ResourceState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding only what was durable; the volatile copies are lost
    pub fn crash(&self) -> MemoryStore {
        let durable = self.durable.read().clone();
        MemoryStore {
            volatile: RwLock::new(durable.clone()),
            durable: RwLock::new(durable),
        }
    }

    /// Current image of a resource (None = unallocated or never written)
    pub fn image(&self, resource: &ResourceRef) -> Option<Vec<u8>> {
        self.volatile
            .read()
            .get(resource)
            .and_then(|state| state.image.clone())
    }

    /// Durable state of a resource
    pub fn durable_state(&self, resource: &ResourceRef) -> ResourceState {
        self.durable
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of resources with any recorded state
    pub fn resource_count(&self) -> usize {
        self.volatile.read().len()
    }
}

impl ResourceStore for MemoryStore {
    fn read_state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        Ok(self
            .volatile
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_default())
    }

    fn write_state(
        &self,
        resource: &ResourceRef,
        version: Lsn,
        image: Option<&[u8]>,
    ) -> Result<()> {
        let state = ResourceState {
            version: Some(version),
            image: image.map(|bytes| bytes.to_vec()),
        };
        self.volatile.write().insert(resource.clone(), state);
        Ok(())
    }

    fn flush(&self, resource: &ResourceRef) -> Result<()> {
        let state = self.volatile.read().get(resource).cloned();
        if let Some(state) = state {
            self.durable.write().insert(resource.clone(), state);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let snapshot = self.volatile.read().clone();
        *self.durable.write() = snapshot;
        Ok(())
    }
}
