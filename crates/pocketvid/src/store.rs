//! Durable job store: one JSON snapshot of every record, rewritten in full
//! on each mutation and swapped in with an atomic rename.
//!
//! Writers in different processes (the daemon and one-shot CLI commands)
//! serialize on an advisory lock held on `<store>.lock` for the whole
//! read-modify-write cycle.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::Utc;
use fs2::FileExt;
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::job::{JobRecord, JobUpdate};

type Snapshot = BTreeMap<String, JobRecord>;

/// Process-wide job store, shared by handle between workers
#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes the whole read-modify-write cycle within this process
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
        }
        Ok(Self {
            lock_path: lock_file(&path),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one record. Never takes the write lock.
    pub fn get(&self, id: &str) -> Result<JobRecord, StoreError> {
        read_snapshot(&self.path)
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Every record, ordered by id
    pub fn list_all(&self) -> Vec<JobRecord> {
        read_snapshot(&self.path).into_values().collect()
    }

    /// Insert a new record; fails if the id is already taken
    pub fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        self.mutate(|snapshot| {
            if snapshot.contains_key(&record.id) {
                return Err(StoreError::AlreadyExists(record.id.clone()));
            }
            snapshot.insert(record.id.clone(), record);
            Ok(())
        })
    }

    /// Merge a partial update into an existing record and persist.
    /// Returns the record as written.
    pub fn upsert(&self, id: &str, update: JobUpdate) -> Result<JobRecord, StoreError> {
        self.mutate(|snapshot| {
            let record = snapshot
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            update
                .apply(record, Utc::now())
                .map_err(|source| StoreError::Transition { id: id.to_string(), source })?;
            Ok(record.clone())
        })
    }

    /// Drop records by id; returns how many existed
    pub fn remove(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.mutate(|snapshot| Ok(ids.iter().filter(|id| snapshot.remove(id.as_str()).is_some()).count()))
    }

    /// Lock, load, apply `f`, persist. Nothing is written when `f` fails.
    fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| io_error(&self.lock_path, e))?;
        FileExt::lock_exclusive(&lock).map_err(|e| io_error(&self.lock_path, e))?;

        let result = self.load_apply_persist(f);

        if let Err(e) = FileExt::unlock(&lock) {
            warn!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
        result
    }

    fn load_apply_persist<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    {
        let mut snapshot = read_snapshot(&self.path);
        let out = f(&mut snapshot)?;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.path, &bytes)?;
        Ok(out)
    }
}

/// Load the snapshot; a missing or unreadable file is an empty store
fn read_snapshot(path: &Path) -> Snapshot {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Snapshot::new(),
        Err(e) => {
            warn!("Job store {} unreadable, treating as empty: {}", path.display(), e);
            return Snapshot::new();
        }
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Snapshot::new();
    }
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Job store {} is corrupt, treating as empty: {}", path.display(), e);
            Snapshot::new()
        }
    }
}

/// Advisory lock file guarding writes to the store at `path`
pub(crate) fn lock_file(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Write `bytes` to a fresh side file next to `path`, flush it to disk, then
/// rename it over `path`. Readers only ever see the old or the new content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
    tmp.write_all(bytes).map_err(|e| io_error(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;
    debug!("Persisted {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
