//! File-backed resource store
//!
//! One file per resource. Writes stay in an in-memory cache until the engine
//! flushes them, which mirrors a buffer pool writing pages back.
//!
//! ## File Format
//! ```text
//! ┌──────────┬───────────┬──────────┬─────────────┬──────────┬─────────┬─────────┬───────┐
//! │Magic (4) │Version (2)│HasLsn (1)│ PageLsn (8) │HasImg (1)│ Len (4) │ CRC (4) │ Image │
//! └──────────┴───────────┴──────────┴─────────────┴──────────┴─────────┴─────────┴───────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::AtlasError;

use super::{ResourceRef, ResourceState, ResourceStore};

const MAGIC: &[u8; 4] = b"AWRS";
const FORMAT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 1 + 8 + 1 + 4 + 4;

/// Resource store keeping one checksummed file per resource
pub struct FileStore {
    /// Directory holding the resource files
    dir: PathBuf,

    /// Resources read or written since open
    cache: RwLock<HashMap<ResourceRef, ResourceState>>,

    /// Resources whose cached state is newer than their file
    dirty: Mutex<HashSet<ResourceRef>>,
}

impl FileStore {
    /// Open or create a store in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of resources with unflushed changes
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    fn resource_path(&self, resource: &ResourceRef) -> PathBuf {
        self.dir.join(format!("res_{}.page", resource))
    }

    fn load(&self, resource: &ResourceRef) -> Result<ResourceState> {
        let path = self.resource_path(resource);
        if !path.exists() {
            return Ok(ResourceState::absent());
        }

        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        decode_state(&bytes).map_err(|reason| {
            AtlasError::Storage(format!("{}: {}", path.display(), reason))
        })
    }

    fn persist(&self, resource: &ResourceRef, state: &ResourceState) -> Result<()> {
        let path = self.resource_path(resource);
        let tmp_path = path.with_extension("tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&encode_state(state))?;
        writer.flush()?;

        let file = writer.into_inner().map_err(|e| {
            AtlasError::Storage(format!("Failed to flush resource file: {}", e))
        })?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

impl ResourceStore for FileStore {
    fn read_state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        if let Some(state) = self.cache.read().get(resource) {
            return Ok(state.clone());
        }

        let state = self.load(resource)?;
        self.cache.write().insert(resource.clone(), state.clone());
        Ok(state)
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
        self.cache.write().insert(resource.clone(), state);
        self.dirty.lock().insert(resource.clone());
        Ok(())
    }

    fn flush(&self, resource: &ResourceRef) -> Result<()> {
        let mut dirty = self.dirty.lock();
        if !dirty.contains(resource) {
            return Ok(());
        }

        let state = self.cache.read().get(resource).cloned().unwrap_or_default();
        self.persist(resource, &state)?;
        dirty.remove(resource);
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let mut dirty = self.dirty.lock();
        let cache = self.cache.read();

        for resource in dirty.iter() {
            let state = cache.get(resource).cloned().unwrap_or_default();
            self.persist(resource, &state)?;
        }
        dirty.clear();
        Ok(())
    }
}

fn encode_state(state: &ResourceState) -> Vec<u8> {
    let image = state.image.as_deref().unwrap_or(&[]);
    let version = state.version.map(Lsn::as_u64).unwrap_or(0);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_le_bytes());
    hasher.update(image);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_SIZE + image.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(state.version.is_some() as u8);
    out.extend_from_slice(&version.to_le_bytes());
    out.push(state.image.is_some() as u8);
    out.extend_from_slice(&(image.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(image);
    out
}

fn decode_state(bytes: &[u8]) -> std::result::Result<ResourceState, String> {
    if bytes.len() < HEADER_SIZE {
        return Err(format!("file too short ({} bytes)", bytes.len()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(format!("invalid magic {:?}", &bytes[0..4]));
    }

    let format = u16::from_le_bytes([bytes[4], bytes[5]]);
    if format != FORMAT_VERSION {
        return Err(format!("unsupported format version {}", format));
    }

    let has_version = bytes[6] != 0;
    let mut version_bytes = [0u8; 8];
    version_bytes.copy_from_slice(&bytes[7..15]);
    let version = u64::from_le_bytes(version_bytes);
    let has_image = bytes[15] != 0;

    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[16..20]);
    let len = u32::from_le_bytes(word) as usize;
    word.copy_from_slice(&bytes[20..24]);
    let stored_crc = u32::from_le_bytes(word);

    let image = bytes
        .get(HEADER_SIZE..HEADER_SIZE + len)
        .ok_or_else(|| format!("image truncated (expected {} bytes)", len))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_le_bytes());
    hasher.update(image);
    if hasher.finalize() != stored_crc {
        return Err("checksum mismatch".to_string());
    }

    Ok(ResourceState {
        version: has_version.then_some(Lsn(version)),
        image: has_image.then(|| image.to_vec()),
    })
}
