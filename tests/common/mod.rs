//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atlaswal::op::{CodecRegistry, Payload};
use atlaswal::wal::{LogManager, LogRecord};
use atlaswal::{
    AtlasError, Config, Engine, Lsn, MemoryStore, Operation, ResourceRef, ResourceState,
    ResourceStore, Result, WalSyncStrategy,
};
use tempfile::TempDir;

pub type MemEngine = Engine<Arc<MemoryStore>>;

// =============================================================================
// Setup
// =============================================================================

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// Config for tests: no automatic checkpoints
pub fn test_config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .checkpoint_threshold_bytes(0)
        .build()
}

pub fn open_engine(dir: &Path, store: Arc<MemoryStore>) -> MemEngine {
    Engine::open(test_config(dir), store).unwrap()
}

pub fn open_log(dir: &Path) -> LogManager {
    LogManager::open(&dir.join("test.wal"), WalSyncStrategy::OnDemand).unwrap()
}

pub fn page(id: u64) -> ResourceRef {
    ResourceRef::page(id, 0)
}

/// Drop the engine without any flush and return what survived in the store
pub fn crash(engine: MemEngine, store: &MemoryStore) -> Arc<MemoryStore> {
    drop(engine);
    Arc::new(store.crash())
}

/// Allocate `size` zero bytes on `resource`, commit, and write it back
pub fn committed_zeroed(engine: &MemEngine, resource: &ResourceRef, size: u32) {
    let txn = engine.begin_transaction().unwrap();
    engine
        .log(txn, resource, Operation::Allocate { size })
        .unwrap();
    engine.commit(txn).unwrap();
    engine.flush_resource(resource).unwrap();
}

/// Every record in the log after `after`
pub fn records_after(log: &LogManager, after: Lsn) -> Vec<LogRecord> {
    log.scan_forward(after.next())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

pub fn decode(record: &LogRecord) -> Payload {
    CodecRegistry::builtin()
        .decode(record.op_code, &record.payload)
        .unwrap()
}

/// Recursively copy a data directory
pub fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}

// =============================================================================
// Failing Store
// =============================================================================

/// Memory store that refuses writes stamped above a version threshold
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_above: AtomicU64,
}

impl FailingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_above: AtomicU64::new(u64::MAX),
        }
    }

    /// Fail every write whose version is greater than `lsn`
    pub fn fail_writes_after(&self, lsn: Lsn) {
        self.fail_above.store(lsn.as_u64(), Ordering::SeqCst);
    }
}

impl ResourceStore for FailingStore {
    fn read_state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        self.inner.read_state(resource)
    }

    fn write_state(
        &self,
        resource: &ResourceRef,
        version: Lsn,
        image: Option<&[u8]>,
    ) -> Result<()> {
        if version.as_u64() > self.fail_above.load(Ordering::SeqCst) {
            return Err(AtlasError::Storage(format!(
                "injected write failure for {} at {}",
                resource, version
            )));
        }
        self.inner.write_state(resource, version, image)
    }

    fn flush(&self, resource: &ResourceRef) -> Result<()> {
        self.inner.flush(resource)
    }

    fn flush_all(&self) -> Result<()> {
        self.inner.flush_all()
    }
}
