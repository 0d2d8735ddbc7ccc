// JSON-file backed key-value cache for one entity type.
//
// The in-memory map is the source of truth; the file is only touched by
// `load_from_file` (startup) and `write_snapshot` (flush). Snapshots go to a
// `.tmp` sibling first and are renamed over the real path, so readers of the
// file only ever see a complete snapshot.

pub mod registry;

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::metrics;

pub use registry::{Database, Registry, StoreKey};

/// Bounds every cached value type has to meet.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

struct Inner<T> {
    path: PathBuf,
    data: RwLock<HashMap<String, T>>,
    // Serializes snapshots of this store so two renames never race.
    snapshot: Mutex<()>,
}

/// Thread-safe, file-persisted map from string key to `T`.
///
/// Cloning a `Store` yields another handle to the same map.
pub struct Store<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Cacheable> Store<T> {
    /// Bind a store to `path` and load whatever snapshot is there.
    /// A missing file yields an empty store; an unreadable one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::empty(path);
        store.load_from_file()?;
        Ok(store)
    }

    /// Bind a store to `path` without reading it.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                data: RwLock::new(HashMap::new()),
                snapshot: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Values for the keys that exist, in the order requested. Misses are skipped.
    pub fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> Vec<T> {
        let data = self.read();
        keys.iter()
            .filter_map(|k| data.get(k.as_ref()).cloned())
            .collect()
    }

    pub fn find_first<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.read().values().find(|v| predicate(v)).cloned()
    }

    pub fn find_many<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.read()
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    pub fn set(&self, key: impl Into<String>, value: T) {
        self.write().insert(key.into(), value);
    }

    /// Insert many entries under a single write lock.
    pub fn extend<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, T)>,
    {
        self.write().extend(entries);
    }

    /// Remove `key`, returning its previous value.
    pub fn delete(&self, key: &str) -> Option<T> {
        self.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of every value.
    pub fn values(&self) -> Vec<T> {
        self.read().values().cloned().collect()
    }

    /// Copy of the whole map.
    pub fn entries(&self) -> HashMap<String, T> {
        self.read().clone()
    }

    /// Replace the in-memory map with the file's contents.
    ///
    /// A missing file is not an error and leaves the store empty.
    pub fn load_from_file(&self) -> Result<(), StoreError> {
        let path = &self.inner.path;
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.write().clear();
                return Ok(());
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let loaded: HashMap<String, T> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), entries = loaded.len(), "store loaded");
        *self.write() = loaded;
        Ok(())
    }

    /// Write the whole map to disk atomically (`<path>.tmp` then rename).
    ///
    /// On failure the existing file and the in-memory map are untouched.
    pub fn write_snapshot(&self) -> Result<(), StoreError> {
        let _guard = self
            .inner
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();

        let result = self.serialize().and_then(|bytes| self.replace_file(&bytes));

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::SNAPSHOTS_TOTAL.with_label_values(&[outcome]).inc();
        metrics::SNAPSHOT_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        result
    }

    fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let data = self.read();
        serde_json::to_vec_pretty(&*data).map_err(|source| StoreError::Serialize {
            path: self.inner.path.clone(),
            source,
        })
    }

    fn replace_file(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let path = &self.inner.path;
        let tmp = tmp_path(path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&tmp, e));
        }

        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(path, e));
        }

        // Persist the rename itself, not just the file contents
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        sync_dir(dir).map_err(|e| StoreError::io(dir, e))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, T>> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, T>> {
        self.inner.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

/// Staging file used by snapshots: `<path>.tmp`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
