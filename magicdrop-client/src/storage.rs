use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tracing::warn;

/// Storage files hold a handful of short strings; anything bigger is corrupt.
pub const MAX_STORAGE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
    #[error("storage unavailable")]
    Unavailable,
}

/// Local key-value persistence for short strings.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// JSON object file; every write replaces the file atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = read_bounded(&self.path)?;
        match serde_json::from_str(&data) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                // Unparseable content is set aside so the next write starts clean.
                let aside = self.corrupt_path();
                warn!(
                    path = %self.path.display(),
                    aside = %aside.display(),
                    "storage file unreadable, starting empty: {}",
                    err
                );
                fs::rename(&self.path, &aside).map_err(StorageError::Rename)?;
                Ok(BTreeMap::new())
            }
        }
    }

    /// Where an unparseable storage file is moved.
    pub fn corrupt_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        entries.insert(key.to_owned(), value.to_owned());
        let payload = serde_json::to_vec_pretty(&entries).map_err(StorageError::Serialize)?;
        write_atomic_with_retry(&self.path, &payload)
    }
}

/// Process-local store. `unavailable()` builds one that fails every call.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: bool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            entries: Mutex::default(),
            unavailable: true,
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.unavailable {
            return Err(StorageError::Unavailable);
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.unavailable {
            return Err(StorageError::Unavailable);
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

pub fn read_bounded(path: &Path) -> Result<String, StorageError> {
    let meta = fs::metadata(path).map_err(StorageError::Metadata)?;
    if meta.len() > MAX_STORAGE_BYTES {
        return Err(StorageError::TooLarge {
            size: meta.len(),
            max: MAX_STORAGE_BYTES,
        });
    }
    fs::read_to_string(path).map_err(StorageError::Read)
}

pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(StorageError::WriteTmp)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).map_err(StorageError::WriteTmp)?;

    // Windows refuses to rename over an existing file.
    if cfg!(windows) && path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(StorageError::Rename)
}

pub fn write_atomic_with_retry(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match write_atomic(path, payload) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(attempt, path = %path.display(), "storage write failed: {}", err);
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
