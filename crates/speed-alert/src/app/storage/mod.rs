//! Storage abstraction used by the app.
//!
//! A single trait `StorageBackend` with a file-backed implementation,
//! `FileStorage`, which keeps a JSON map of string keys to string values in a
//! per-user configuration directory and writes it back synchronously on every
//! change.
//!
//! Structured data goes through the `save_json_backend`/`load_json_backend`
//! helpers so the trait stays object-safe.

use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Platform storage error: {0}")]
    Platform(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Simple generic storage backend trait.
///
/// Keys and values are UTF-8 strings.
pub trait StorageBackend: Send + Sync {
    /// Store a string value for a key.
    fn set_string(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Read a string value for a key. Returns Ok(None) when key is missing.
    fn get_string(&self, key: &str) -> StorageResult<Option<String>>;

    /// Remove a key (no-op if key does not exist).
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Pick up changes made outside this process. Returns whether anything changed.
    ///
    /// Backends without an external copy have nothing to do.
    fn reload(&self) -> StorageResult<bool> {
        Ok(false)
    }
}

pub fn save_json_backend<T: Serialize>(
    backend: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    match serde_json::to_string(value) {
        Ok(s) => backend.set_string(key, &s),
        Err(e) => Err(StorageError::Json(e.to_string())),
    }
}

pub fn load_json_backend<T: DeserializeOwned>(
    backend: &dyn StorageBackend,
    key: &str,
) -> StorageResult<Option<T>> {
    match backend.get_string(key)? {
        Some(s) => match serde_json::from_str::<T>(&s) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(StorageError::Json(e.to_string())),
        },
        None => Ok(None),
    }
}

/// File-based storage: a single JSON file holding a map of key -> string value.
///
/// On init the file is read into memory; mutations update memory and flush the
/// whole file back to disk. [`reload`](StorageBackend::reload) re-reads the file
/// so edits made by hand while the app runs are seen.
pub struct FileStorage {
    path: PathBuf,
    inner: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Default storage file for the current user:
    /// - Windows: %APPDATA%/SpeedAlert/storage.json
    /// - Else: $HOME/.config/speed-alert/storage.json
    pub fn default_storage_path() -> PathBuf {
        if cfg!(windows)
            && let Ok(appdata) = std::env::var("APPDATA")
        {
            return Path::new(&appdata).join("SpeedAlert").join("storage.json");
        }

        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home)
                .join(".config")
                .join("speed-alert")
                .join("storage.json");
        }

        Path::new(".").join("speed-alert-storage.json")
    }

    pub fn new_with_path(path: Option<PathBuf>) -> StorageResult<Self> {
        let path = path.unwrap_or_else(Self::default_storage_path);

        if let Some(parent) = path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return Err(StorageError::Io(format!(
                "Failed to create storage parent directory: {}",
                e
            )));
        }

        let map = Self::read_map(&path)?.unwrap_or_default();

        tracing::debug!("Settings storage at {}", path.display());
        Ok(FileStorage {
            path,
            inner: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Contents of the file at `path`, `None` if there is no file
    fn read_map(path: &Path) -> StorageResult<Option<HashMap<String, String>>> {
        if !path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(path)
            .map_err(|e| StorageError::Io(format!("Failed to read storage file: {}", e)))?;
        if s.trim().is_empty() {
            return Ok(Some(HashMap::new()));
        }
        serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| StorageError::Json(format!("Failed to parse storage JSON: {}", e)))
    }

    fn flush_locked(&self, locked: &HashMap<String, String>) -> StorageResult<()> {
        let s =
            serde_json::to_string_pretty(locked).map_err(|e| StorageError::Json(e.to_string()))?;
        fs::write(&self.path, s).map_err(|e| StorageError::Io(format!("write failed: {}", e)))
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Platform(format!("mutex poisoned: {:?}", e)))
    }
}

impl StorageBackend for FileStorage {
    fn set_string(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut guard = self.lock()?;
        guard.insert(key.to_string(), value.to_string());
        self.flush_locked(&guard)
    }

    fn get_string(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut guard = self.lock()?;
        guard.remove(key);
        self.flush_locked(&guard)
    }

    /// A deleted file keeps what is in memory; an unreadable one is an error and
    /// also keeps it
    fn reload(&self) -> StorageResult<bool> {
        let Some(map) = Self::read_map(&self.path)? else {
            return Ok(false);
        };
        let mut guard = self.lock()?;
        if *guard == map {
            return Ok(false);
        }
        *guard = map;
        Ok(true)
    }
}
