//! Short-term resource latches
//!
//! A latch protects a resource's in-memory structure for the duration of a
//! single redo/undo apply call. Latches are not transactional locks and are
//! never held across calls.

use std::collections::HashSet;

use parking_lot::{Condvar, Mutex};

use super::ResourceRef;

/// Table of currently latched resources
#[derive(Default)]
pub struct LatchTable {
    held: Mutex<HashSet<ResourceRef>>,
    released: Condvar,
}

impl LatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `resource` is free, then latch it exclusively
    pub fn acquire(&self, resource: &ResourceRef) -> LatchGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(resource) {
            self.released.wait(&mut held);
        }
        held.insert(resource.clone());

        LatchGuard {
            table: self,
            resource: resource.clone(),
        }
    }

    /// Number of resources latched right now
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Exclusive latch on one resource, released on drop
pub struct LatchGuard<'a> {
    table: &'a LatchTable,
    resource: ResourceRef,
}

impl LatchGuard<'_> {
    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock();
        held.remove(&self.resource);
        drop(held);
        self.table.released.notify_all();
    }
}
