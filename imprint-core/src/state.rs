//! Resumable transfer progress and where it is kept.
//!
//! A [`TransferState`] records, per (image, device, chunk size), which chunks
//! are on the device and which of those were read back and matched. It is
//! saved through a [`StateStore`] as the write proceeds.
use crate::error::StoreError;
use crate::plan::{Chunk, ChunkPlan};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// A fixed-length set of chunk indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    len: usize,
    words: Vec<u64>,
}

impl ChunkSet {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(64)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Returns `true` if the index was not already present.
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let was = self.contains(index);
        self.words[index / 64] |= 1 << (index % 64);
        !was
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let was = self.contains(index);
        self.words[index / 64] &= !(1 << (index % 64));
        was
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.contains(*i))
    }
}

/// Where a device's transfer stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Writing,
    Paused,
    WrittenPendingVerification,
    Verifying,
    Completed,
    Failed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Writing => "Writing",
            Phase::Paused => "Paused",
            Phase::WrittenPendingVerification => "Written",
            Phase::Verifying => "Verifying",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// Identifies a resumable record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub image_checksum: String,
    pub device_id: String,
    pub chunk_size: u64,
}

impl StateKey {
    pub fn new(image_checksum: &str, device_id: &str, chunk_size: u64) -> Self {
        Self {
            image_checksum: image_checksum.to_string(),
            device_id: device_id.to_string(),
            chunk_size,
        }
    }

    /// A file-name-safe rendering of the key.
    pub fn file_stem(&self) -> String {
        let device: String = self
            .device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let checksum: String = self.image_checksum.chars().take(16).collect();
        format!("{device}-{checksum}-{}", self.chunk_size)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.image_checksum, self.device_id, self.chunk_size
        )
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Progress of one image onto one device.
///
/// A chunk is only ever in `verified` while it is also in `written`.
/// `mismatched` holds chunks whose read-back differed from the source; they
/// stay `written` and are rewritten by the next resumed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub key: StateKey,
    pub image_size: u64,
    pub chunk_count: usize,
    written: ChunkSet,
    verified: ChunkSet,
    mismatched: ChunkSet,
    pub bytes_written: u64,
    pub started_at: u64,
    pub last_activity: u64,
    pub phase: Phase,
    /// Set when the last completed write skipped verification.
    pub verification_skipped: bool,
}

impl TransferState {
    pub fn new(key: StateKey, plan: &ChunkPlan) -> Self {
        let n = plan.chunk_count();
        let now = unix_now();
        Self {
            key,
            image_size: plan.image_size(),
            chunk_count: n,
            written: ChunkSet::new(n),
            verified: ChunkSet::new(n),
            mismatched: ChunkSet::new(n),
            bytes_written: 0,
            started_at: now,
            last_activity: now,
            phase: Phase::Pending,
            verification_skipped: false,
        }
    }

    /// Whether this record describes `plan` and is internally consistent.
    pub fn matches(&self, plan: &ChunkPlan) -> bool {
        self.image_size == plan.image_size()
            && self.key.chunk_size == plan.chunk_size()
            && self.chunk_count == plan.chunk_count()
            && self.written.capacity() == self.chunk_count
            && self.verified.capacity() == self.chunk_count
            && self.mismatched.capacity() == self.chunk_count
            && self.verified.iter().all(|i| self.written.contains(i))
    }

    pub fn is_written(&self, index: usize) -> bool {
        self.written.contains(index)
    }

    pub fn is_verified(&self, index: usize) -> bool {
        self.verified.contains(index)
    }

    pub fn is_mismatched(&self, index: usize) -> bool {
        self.mismatched.contains(index)
    }

    pub fn needs_write(&self, index: usize) -> bool {
        !self.written.contains(index) || self.mismatched.contains(index)
    }

    pub fn needs_verify(&self, index: usize) -> bool {
        self.written.contains(index)
            && !self.verified.contains(index)
            && !self.mismatched.contains(index)
    }

    pub fn written_count(&self) -> usize {
        self.written.count()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.count()
    }

    pub fn mismatched_chunks(&self) -> Vec<usize> {
        self.mismatched.iter().collect()
    }

    pub fn is_fully_written(&self) -> bool {
        self.written.is_full() && self.mismatched.is_empty()
    }

    pub fn is_fully_verified(&self) -> bool {
        self.verified.is_full()
    }

    /// Records that `chunk` now holds source bytes on the device. Any earlier
    /// verification verdict for it no longer applies.
    pub fn mark_written(&mut self, chunk: &Chunk) {
        if self.written.insert(chunk.index) {
            self.bytes_written += chunk.len;
        }
        self.verified.remove(chunk.index);
        self.mismatched.remove(chunk.index);
        self.touch();
    }

    /// Takes back a write that could not be confirmed durable.
    pub fn forget_written(&mut self, chunk: &Chunk) {
        if self.written.remove(chunk.index) {
            self.bytes_written = self.bytes_written.saturating_sub(chunk.len);
        }
        self.verified.remove(chunk.index);
    }

    /// Records a successful read-back. Ignored for chunks not written.
    pub fn mark_verified(&mut self, index: usize) {
        if self.written.contains(index) {
            self.verified.insert(index);
            self.mismatched.remove(index);
        }
        self.touch();
    }

    pub fn mark_mismatched(&mut self, index: usize) {
        self.verified.remove(index);
        self.mismatched.insert(index);
        self.touch();
    }

    /// Chunks that still stand between this record and a finished job.
    pub fn unresolved_chunks(&self, verify: bool) -> Vec<usize> {
        (0..self.chunk_count)
            .filter(|i| self.needs_write(*i) || (verify && !self.verified.contains(*i)))
            .collect()
    }

    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }
}

/// Durable key-value storage for [`TransferState`] records.
pub trait StateStore: Send + Sync {
    fn load(&self, key: &StateKey) -> Result<Option<TransferState>, StoreError>;
    fn save(&self, key: &StateKey, state: &TransferState) -> Result<(), StoreError>;
    fn delete(&self, key: &StateKey) -> Result<(), StoreError>;
    /// Every key currently stored.
    fn keys(&self) -> Result<Vec<StateKey>, StoreError>;
}

/// Drops every record for `device_id` other than `keep`.
///
/// Once a new image starts going onto a device, progress recorded for any
/// other image or chunk size on that device no longer describes its contents.
pub fn forget_other_records(
    store: &dyn StateStore,
    device_id: &str,
    keep: &StateKey,
) -> Result<(), StoreError> {
    for key in store.keys()? {
        if key.device_id == device_id && &key != keep {
            store.delete(&key)?;
        }
    }
    Ok(())
}

/// Loads the record for `key` if it can be resumed against `plan`.
pub fn load_resumable(
    store: &dyn StateStore,
    key: &StateKey,
    plan: &ChunkPlan,
) -> Result<Option<TransferState>, StoreError> {
    match store.load(key)? {
        Some(state) if state.key == *key && state.matches(plan) => Ok(Some(state)),
        Some(_) => {
            warn!("discarding stale transfer record {key}");
            store.delete(key)?;
            Ok(None)
        }
        None => Ok(None),
    }
}

/// One JSON document per record in a directory.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    fn read(&self, path: &Path) -> Result<Option<TransferState>, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: path.display().to_string(),
                source,
            })
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, key: &StateKey) -> Result<Option<TransferState>, StoreError> {
        self.read(&self.path_for(key))
    }

    fn save(&self, key: &StateKey, state: &TransferState) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let io_err = |source: io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;

        // Write beside the target and rename so a crash never leaves a torn record.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn keys(&self) -> Result<Vec<StateKey>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut keys = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path) {
                Ok(Some(state)) => keys.push(state.key),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable transfer record: {e}"),
            }
        }
        Ok(keys)
    }
}

/// Keeps records in memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<StateKey, TransferState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &StateKey) -> Result<Option<TransferState>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn save(&self, key: &StateKey, state: &TransferState) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), state.clone());
        Ok(())
    }

    fn delete(&self, key: &StateKey) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<StateKey>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}
