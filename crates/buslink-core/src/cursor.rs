//! Replay cursor persistence.
//!
//! The bus hands out a monotonic `last` value with every batch. Saving it
//! after each processed batch lets a restarted client resume after the last
//! notification it handled instead of replaying the whole backlog.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Opaque replay position handed out by the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Cursor of a client that has processed nothing yet.
    pub const ZERO: Self = Self(0);

    /// Raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Move forward to `other` if it is newer. Returns `true` if advanced.
    pub fn advance_to(&mut self, other: Self) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key/value surface used to save and load the cursor across restarts.
pub trait CursorStore: Send + Sync {
    /// Load the cursor stored under `key`, or `default` if none is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be read.
    fn load(&self, key: &str, default: Cursor) -> Result<Cursor, StoreError>;

    /// Store `cursor` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be written.
    fn save(&self, key: &str, cursor: Cursor) -> Result<(), StoreError>;
}

impl<T: CursorStore + ?Sized> CursorStore for Arc<T> {
    fn load(&self, key: &str, default: Cursor) -> Result<Cursor, StoreError> {
        (**self).load(key, default)
    }

    fn save(&self, key: &str, cursor: Cursor) -> Result<(), StoreError> {
        (**self).save(key, cursor)
    }
}

/// In-memory cursor store for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    values: Mutex<HashMap<String, Cursor>>,
    saves: AtomicUsize,
}

impl InMemoryCursorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding one value.
    #[must_use]
    pub fn with_value(key: impl Into<String>, cursor: Cursor) -> Self {
        let store = Self::default();
        store
            .values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), cursor);
        store
    }

    /// Value currently stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Cursor> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load(&self, key: &str, default: Cursor) -> Result<Cursor, StoreError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StoreError::Poisoned("cursor store mutex poisoned".into()))?;
        Ok(values.get(key).copied().unwrap_or(default))
    }

    fn save(&self, key: &str, cursor: Cursor) -> Result<(), StoreError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::Poisoned("cursor store mutex poisoned".into()))?;
        values.insert(key.to_string(), cursor);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Cursor store backed by a JSON object file.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct FileCursorStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCursorStore {
    /// Create a store writing to `path`. The file is created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, Cursor>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self, key: &str, default: Cursor) -> Result<Cursor, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Poisoned("file cursor store mutex poisoned".into()))?;
        Ok(self.read_all()?.get(key).copied().unwrap_or(default))
    }

    fn save(&self, key: &str, cursor: Cursor) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Poisoned("file cursor store mutex poisoned".into()))?;

        let mut values = self.read_all()?;
        values.insert(key.to_string(), cursor);
        let encoded = serde_json::to_vec_pretty(&values)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, encoded).map_err(|source| self.io_error(source))?;
        std::fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))?;

        tracing::trace!(key, cursor = cursor.value(), path = %self.path.display(), "Cursor saved");
        Ok(())
    }
}
