//! Persistent key/value store.
//!
//! The pipeline consumes the store through [`PersistentStore`]: snapshots for
//! reads, scoped editors for writes. An editor buffers every slot and makes
//! them visible together on [`Editor::commit`]; dropping or aborting an editor
//! leaves the previous entry (if any) untouched.
//!
//! # On-disk format
//!
//! [`DiskLruStore`] keeps one file per entry, named by the SHA-256 of the key:
//!
//! ```text
//! <dir>/<fingerprint>.entry
//!
//! magic      4 bytes   "BPC1"
//! slots      u32 LE
//! lengths    u64 LE x slots
//! payloads   concatenated slot bytes
//! ```
//!
//! Commits write `<fingerprint>.tmp` and rename it over the entry, so readers
//! observe either the old or the new entry, never a partial one. Entries are
//! evicted least-recently-used first once the total size exceeds the budget.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::key::fingerprint;

/// Default number of slots per entry: payload plus one metadata slot.
pub const DEFAULT_SLOT_COUNT: usize = 2;

/// Default disk budget: 256MB
pub const DEFAULT_DISK_CACHE_CAPACITY: u64 = 256 * 1024 * 1024;

const MAGIC: &[u8; 4] = b"BPC1";
const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";

// =============================================================================
// Store Interface
// =============================================================================

/// Read-only view of a committed entry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    slots: Vec<Bytes>,
}

impl Snapshot {
    pub fn new(slots: Vec<Bytes>) -> Self {
        Self { slots }
    }

    pub fn slot(&self, index: usize) -> Option<&Bytes> {
        self.slots.get(index)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Scoped write of a single entry.
pub trait Editor: Send {
    /// Stage the bytes for `slot`.
    fn write(&mut self, slot: usize, data: &[u8]) -> Result<(), CacheError>;

    /// Publish every staged slot atomically.
    fn commit(self: Box<Self>) -> Result<(), CacheError>;

    /// Discard the edit.
    fn abort(self: Box<Self>);
}

/// Byte-oriented persistent store with atomic multi-slot commits.
///
/// Edits on distinct keys are independent; at most one edit per key may be
/// open at a time.
pub trait PersistentStore: Send + Sync {
    /// Read a committed entry. `Ok(None)` if absent, `Err(Corrupt)` if unreadable.
    fn open(&self, key: &str) -> Result<Option<Snapshot>, CacheError>;

    /// Begin an edit. `Ok(None)` if another edit on `key` is open.
    fn edit(&self, key: &str) -> Result<Option<Box<dyn Editor>>, CacheError>;

    /// Delete an entry, returning whether it existed.
    fn remove(&self, key: &str) -> Result<bool, CacheError>;
}

// =============================================================================
// DiskLruStore
// =============================================================================

/// File-backed [`PersistentStore`] with size-bounded LRU eviction.
#[derive(Clone)]
pub struct DiskLruStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    slot_count: usize,
    max_size: u64,
    state: Mutex<StoreState>,
}

struct StoreState {
    /// Fingerprint to entry size, least recently used first
    index: LruCache<String, u64>,
    total_size: u64,
    editing: HashSet<String>,
}

impl DiskLruStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// Existing entries are indexed by modification time, oldest first, and
    /// leftover temporary files from interrupted commits are deleted.
    pub fn open(
        dir: impl Into<PathBuf>,
        slot_count: usize,
        max_size: u64,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut found: Vec<(SystemTime, String, u64)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match path.extension().and_then(|e| e.to_str()) {
                Some(ENTRY_EXT) => {
                    let meta = entry.metadata()?;
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((modified, stem.to_string(), meta.len()));
                }
                Some(TMP_EXT) => {
                    debug!(path = %path.display(), "removing stale temporary cache file");
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }
        found.sort();

        let mut index = LruCache::unbounded();
        let mut total_size = 0;
        for (_, name, size) in found {
            total_size += size;
            index.put(name, size);
        }

        let store = Self {
            inner: Arc::new(StoreInner {
                dir,
                slot_count,
                max_size,
                state: Mutex::new(StoreState {
                    index,
                    total_size,
                    editing: HashSet::new(),
                }),
            }),
        };
        store.inner.trim_to_size(&mut store.inner.state());
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.inner.dir
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slot_count
    }

    /// Total bytes of committed entries.
    pub fn size(&self) -> u64 {
        self.inner.state().total_size
    }

    pub fn len(&self) -> usize {
        self.inner.state().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u64 {
        self.inner.max_size
    }
}

impl StoreInner {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(&self, fp: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", fp, ENTRY_EXT))
    }

    fn tmp_path(&self, fp: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", fp, TMP_EXT))
    }

    fn trim_to_size(&self, state: &mut StoreState) {
        while state.total_size > self.max_size {
            let Some((fp, size)) = state.index.pop_lru() else {
                break;
            };
            state.total_size = state.total_size.saturating_sub(size);
            if let Err(e) = fs::remove_file(self.entry_path(&fp)) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(entry = %fp, error = %e, "failed to evict cache entry");
                }
            }
            debug!(entry = %fp, size, "evicted cache entry");
        }
    }
}

impl PersistentStore for DiskLruStore {
    fn open(&self, key: &str) -> Result<Option<Snapshot>, CacheError> {
        let fp = fingerprint(key);
        let data = match fs::read(self.inner.entry_path(&fp)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot = decode_entry(&data, self.inner.slot_count).map_err(|message| {
            CacheError::Corrupt {
                key: key.to_string(),
                message,
            }
        })?;

        let mut state = self.inner.state();
        if state.index.get(&fp).is_none() {
            // Written by another process since we indexed the directory
            let size = data.len() as u64;
            state.index.put(fp, size);
            state.total_size += size;
        }
        Ok(Some(snapshot))
    }

    fn edit(&self, key: &str) -> Result<Option<Box<dyn Editor>>, CacheError> {
        let fp = fingerprint(key);
        let mut state = self.inner.state();
        if !state.editing.insert(fp.clone()) {
            return Ok(None);
        }
        drop(state);

        Ok(Some(Box::new(DiskEditor {
            store: Arc::clone(&self.inner),
            key: key.to_string(),
            fingerprint: fp,
            slots: vec![None; self.inner.slot_count],
            finished: false,
        })))
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let fp = fingerprint(key);
        let mut state = self.inner.state();
        if state.editing.contains(&fp) {
            return Err(CacheError::Busy(key.to_string()));
        }

        let existed = match fs::remove_file(self.inner.entry_path(&fp)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Some(size) = state.index.pop(&fp) {
            state.total_size = state.total_size.saturating_sub(size);
        }
        Ok(existed)
    }
}

// =============================================================================
// DiskEditor
// =============================================================================

struct DiskEditor {
    store: Arc<StoreInner>,
    key: String,
    fingerprint: String,
    slots: Vec<Option<Vec<u8>>>,
    finished: bool,
}

impl DiskEditor {
    fn write_error(&self, message: impl Into<String>) -> CacheError {
        CacheError::Write {
            key: self.key.clone(),
            message: message.into(),
        }
    }

    fn publish(&mut self) -> Result<(), CacheError> {
        let mut slots = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(data) => slots.push(data.as_slice()),
                None => return Err(self.write_error(format!("slot {} was never written", i))),
            }
        }
        let encoded = encode_entry(&slots);

        let tmp = self.store.tmp_path(&self.fingerprint);
        let dest = self.store.entry_path(&self.fingerprint);
        fs::write(&tmp, &encoded).map_err(|e| self.write_error(e.to_string()))?;
        fs::rename(&tmp, &dest).map_err(|e| self.write_error(e.to_string()))?;

        let mut state = self.store.state();
        let size = encoded.len() as u64;
        if let Some(old) = state.index.put(self.fingerprint.clone(), size) {
            state.total_size = state.total_size.saturating_sub(old);
        }
        state.total_size += size;
        self.store.trim_to_size(&mut state);
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.store.state().editing.remove(&self.fingerprint);
    }
}

impl Editor for DiskEditor {
    fn write(&mut self, slot: usize, data: &[u8]) -> Result<(), CacheError> {
        let count = self.slots.len();
        match self.slots.get_mut(slot) {
            Some(target) => {
                *target = Some(data.to_vec());
                Ok(())
            }
            None => Err(self.write_error(format!("slot {} out of range (0..{})", slot, count))),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<(), CacheError> {
        let result = self.publish();
        if result.is_err() {
            let _ = fs::remove_file(self.store.tmp_path(&self.fingerprint));
        }
        self.finish();
        result
    }

    fn abort(mut self: Box<Self>) {
        self.finish();
    }
}

impl Drop for DiskEditor {
    fn drop(&mut self) {
        self.finish();
    }
}

// =============================================================================
// Entry Encoding
// =============================================================================

fn encode_entry(slots: &[&[u8]]) -> Vec<u8> {
    let payload: usize = slots.iter().map(|s| s.len()).sum();
    let mut out = Vec::with_capacity(8 + slots.len() * 8 + payload);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    for slot in slots {
        out.extend_from_slice(&(slot.len() as u64).to_le_bytes());
    }
    for slot in slots {
        out.extend_from_slice(slot);
    }
    out
}

fn decode_entry(data: &[u8], expected_slots: usize) -> Result<Snapshot, String> {
    if data.len() < 8 || &data[..4] != MAGIC {
        return Err("bad header".to_string());
    }
    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if count != expected_slots {
        return Err(format!("expected {} slots, found {}", expected_slots, count));
    }

    let lengths_end = 8 + count * 8;
    if data.len() < lengths_end {
        return Err("truncated slot table".to_string());
    }
    let lengths = data[8..lengths_end]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .map(usize::try_from)
        .collect::<Result<Vec<usize>, _>>()
        .map_err(|_| "slot table overflow".to_string())?;

    let total = lengths
        .iter()
        .try_fold(0usize, |acc, len| acc.checked_add(*len))
        .ok_or_else(|| "slot table overflow".to_string())?;
    let available = data.len() - lengths_end;
    if total != available {
        return Err(format!(
            "payload length mismatch: table says {}, file has {}",
            total, available
        ));
    }

    let body = Bytes::copy_from_slice(&data[lengths_end..]);
    let mut slots = Vec::with_capacity(count);
    let mut offset = 0usize;
    for len in lengths {
        slots.push(body.slice(offset..offset + len));
        offset += len;
    }
    Ok(Snapshot::new(slots))
}
