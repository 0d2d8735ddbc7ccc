// Process-wide directory of stores: registry -> database (one per map) -> store.
//
// Stores of different value types live side by side behind `ErasedStore`.
// The typed API goes through `StoreKey<T>`, so the value type is fixed by the
// key; lookups by bare name check the type and report `TypeMismatch`.

use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{FlushError, RegistryError, StoreError};
use crate::metrics;

use super::{Cacheable, Store};

/// Typed handle naming a store and fixing its value type.
pub struct StoreKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> StoreKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

trait ErasedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn value_type(&self) -> &'static str;
    fn write_snapshot(&self) -> Result<(), StoreError>;
    fn len(&self) -> usize;
    fn get_json(&self, key: &str) -> Option<serde_json::Value>;
}

impl<T: Cacheable> ErasedStore for Store<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        Store::write_snapshot(self)
    }

    fn len(&self) -> usize {
        Store::len(self)
    }

    fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        self.get(key).and_then(|v| serde_json::to_value(v).ok())
    }
}

/// A named group of stores sharing one directory on disk.
pub struct Database {
    name: String,
    dir: PathBuf,
    stores: RwLock<HashMap<String, Arc<dyn ErasedStore>>>,
    flush_lock: Mutex<()>,
}

impl Database {
    /// Stores of this database live at `<dir>/<store>.json`.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            stores: RwLock::new(HashMap::new()),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the store `name`, loading its snapshot, or return the existing
    /// one. Asking for an existing name with a different value type fails with
    /// [`RegistryError::TypeMismatch`].
    pub fn define_store<T: Cacheable>(&self, name: &str) -> Result<Store<T>, RegistryError> {
        if let Some(existing) = self.read().get(name) {
            return downcast(name, existing.as_ref());
        }

        let mut stores = self.write();
        // Another caller may have defined it between the two locks
        if let Some(existing) = stores.get(name) {
            return downcast(name, existing.as_ref());
        }

        let store = Store::<T>::open(self.dir.join(format!("{name}.json")))?;
        tracing::info!(
            database = %self.name,
            store = name,
            entries = store.len(),
            "store defined"
        );
        stores.insert(name.to_string(), Arc::new(store.clone()));
        Ok(store)
    }

    /// Look up a previously defined store.
    pub fn get_store<T: Cacheable>(&self, name: &str) -> Result<Store<T>, RegistryError> {
        match self.read().get(name) {
            Some(existing) => downcast(name, existing.as_ref()),
            None => Err(RegistryError::StoreNotFound {
                database: self.name.clone(),
                store: name.to_string(),
            }),
        }
    }

    /// [`define_store`](Self::define_store) through a typed key.
    pub fn define<T: Cacheable>(&self, key: &StoreKey<T>) -> Result<Store<T>, RegistryError> {
        self.define_store(key.name())
    }

    /// [`get_store`](Self::get_store) through a typed key.
    pub fn store<T: Cacheable>(&self, key: &StoreKey<T>) -> Result<Store<T>, RegistryError> {
        self.get_store(key.name())
    }

    /// Names of every defined store, sorted.
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Entry count per store.
    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.read()
            .iter()
            .map(|(name, store)| (name.clone(), store.len()))
            .collect()
    }

    /// JSON view of one entry, without knowing the store's value type.
    pub fn lookup_json(
        &self,
        store: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        match self.read().get(store) {
            Some(s) => Ok(s.get_json(key)),
            None => Err(RegistryError::StoreNotFound {
                database: self.name.clone(),
                store: store.to_string(),
            }),
        }
    }

    /// Snapshot every store. Concurrent flushes of the same database are
    /// serialized; a failing store does not stop the others.
    pub fn flush(&self) -> Result<(), FlushError> {
        let _guard = self
            .flush_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let stores: Vec<(String, Arc<dyn ErasedStore>)> = self
            .read()
            .iter()
            .map(|(name, store)| (name.clone(), store.clone()))
            .collect();

        let mut failures = Vec::new();
        for (name, store) in stores {
            metrics::STORE_ENTRIES
                .with_label_values(&[self.name.as_str(), name.as_str()])
                .set(store.len() as i64);
            if let Err(e) = store.write_snapshot() {
                tracing::error!(database = %self.name, store = %name, "snapshot failed: {e}");
                failures.push((name, e));
            }
        }

        if failures.is_empty() {
            tracing::debug!(database = %self.name, "database flushed");
            Ok(())
        } else {
            Err(FlushError {
                database: self.name.clone(),
                failures,
            })
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn ErasedStore>>> {
        self.stores.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn ErasedStore>>> {
        self.stores.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("stores", &self.store_names())
            .finish()
    }
}

fn downcast<T: Cacheable>(name: &str, store: &dyn ErasedStore) -> Result<Store<T>, RegistryError> {
    store
        .as_any()
        .downcast_ref::<Store<T>>()
        .cloned()
        .ok_or_else(|| RegistryError::TypeMismatch {
            store: name.to_string(),
            requested: type_name::<T>(),
            actual: store.value_type(),
        })
}

/// Maps database names to databases.
#[derive(Debug, Default)]
pub struct Registry {
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `database` under its own name. If that name is taken, the
    /// existing database is returned and `database` is discarded.
    pub fn register(&self, database: Database) -> Arc<Database> {
        let mut databases = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        databases
            .entry(database.name().to_string())
            .or_insert_with(|| Arc::new(database))
            .clone()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Database>, RegistryError> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::DatabaseNotFound(name.to_string()))
    }

    /// Shortcut for `get(database)?.get_store(store)`.
    pub fn get_store<T: Cacheable>(
        &self,
        database: &str,
        store: &str,
    ) -> Result<Store<T>, RegistryError> {
        self.get(database)?.get_store(store)
    }

    /// Every registered database, sorted by name.
    pub fn databases(&self) -> Vec<Arc<Database>> {
        let mut all: Vec<Arc<Database>> = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Flush every database, collecting each one's failures.
    pub fn flush_all(&self) -> Result<(), Vec<FlushError>> {
        let failures: Vec<FlushError> = self
            .databases()
            .iter()
            .filter_map(|db| db.flush().err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::fs;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Town {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Nation {
        name: String,
        capital: String,
    }

    const TOWNS: StoreKey<Town> = StoreKey::new("towns");
    const NATIONS: StoreKey<Nation> = StoreKey::new("nations");

    #[test]
    fn test_define_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new("aurora", dir.path());

        let first = db.define(&TOWNS).unwrap();
        first.set("a", Town { name: "Alpha".into() });

        let second = db.define(&TOWNS).unwrap();
        assert_eq!(second.get("a"), Some(Town { name: "Alpha".into() }));
        assert_eq!(db.store_names(), vec!["towns".to_string()]);
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new("aurora", dir.path());
        db.define(&TOWNS).unwrap();

        let err = db.get_store::<Nation>("towns").unwrap_err();
        match err {
            RegistryError::TypeMismatch { store, requested, actual } => {
                assert_eq!(store, "towns");
                assert!(requested.ends_with("Nation"));
                assert!(actual.ends_with("Town"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            db.define_store::<Nation>("towns"),
            Err(RegistryError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_store_and_database() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.register(Database::new("aurora", dir.path()));

        assert!(matches!(
            registry.get("nostra"),
            Err(RegistryError::DatabaseNotFound(name)) if name == "nostra"
        ));
        assert!(matches!(
            registry.get_store::<Town>("aurora", "towns"),
            Err(RegistryError::StoreNotFound { .. })
        ));
    }

    #[test]
    fn test_register_returns_existing_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();

        let first = registry.register(Database::new("aurora", dir.path()));
        first.define(&TOWNS).unwrap();

        let second = registry.register(Database::new("aurora", dir.path().join("other")));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.dir(), dir.path());
        assert!(registry.get_store::<Town>("aurora", "towns").is_ok());
    }

    #[test]
    fn test_define_store_loads_existing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("towns.json"),
            r#"{"t1": {"name": "Loaded"}}"#,
        )
        .unwrap();

        let db = Database::new("aurora", dir.path());
        let towns = db.define(&TOWNS).unwrap();
        assert_eq!(towns.get("t1"), Some(Town { name: "Loaded".into() }));
    }

    #[test]
    fn test_define_store_with_corrupt_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("towns.json"), "[1, 2").unwrap();

        let db = Database::new("aurora", dir.path());
        assert!(matches!(
            db.define(&TOWNS),
            Err(RegistryError::Store(StoreError::Corrupt { .. }))
        ));
        assert!(db.store_names().is_empty());
    }

    #[test]
    fn test_flush_writes_every_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let db = registry.register(Database::new("aurora", dir.path()));

        db.define(&TOWNS).unwrap().set("t", Town { name: "T".into() });
        db.define(&NATIONS).unwrap().set(
            "n",
            Nation {
                name: "N".into(),
                capital: "T".into(),
            },
        );

        registry.flush_all().unwrap();
        assert!(dir.path().join("towns.json").exists());
        assert!(dir.path().join("nations.json").exists());

        let fresh = Database::new("aurora", dir.path());
        assert_eq!(fresh.define(&NATIONS).unwrap().len(), 1);
    }

    #[test]
    fn test_flush_aggregates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new("aurora", dir.path());
        db.define(&TOWNS).unwrap().set("t", Town { name: "T".into() });
        db.define(&NATIONS).unwrap();

        // A directory squatting on the target path makes the rename fail
        fs::create_dir(dir.path().join("towns.json")).unwrap();
        fs::write(dir.path().join("towns.json").join("keep"), b"x").unwrap();

        let err = db.flush().unwrap_err();
        assert_eq!(err.database, "aurora");
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "towns");
        // The healthy store was still written
        assert!(dir.path().join("nations.json").exists());
    }

    #[test]
    fn test_stats_and_lookup_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new("aurora", dir.path());
        db.define(&TOWNS).unwrap().set("t", Town { name: "T".into() });
        db.define(&NATIONS).unwrap();

        let stats = db.stats();
        assert_eq!(stats.get("towns"), Some(&1));
        assert_eq!(stats.get("nations"), Some(&0));

        let value = db.lookup_json("towns", "t").unwrap().unwrap();
        assert_eq!(value["name"], "T");
        assert_eq!(db.lookup_json("towns", "missing").unwrap(), None);
        assert!(db.lookup_json("players", "x").is_err());
    }

    #[test]
    fn test_concurrent_flushes_alongside_writers_and_defines() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new("aurora", dir.path());
        let towns = db.define(&TOWNS).unwrap();

        std::thread::scope(|s| {
            for t in 0..3u32 {
                let towns = towns.clone();
                s.spawn(move || {
                    for i in 0..100u32 {
                        towns.set(format!("{t}-{i}"), Town { name: format!("T{i}") });
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..10 {
                        db.flush().unwrap();
                    }
                });
            }
            s.spawn(|| {
                for i in 0..10 {
                    let store = db.define_store::<Nation>(&format!("nations-{i}")).unwrap();
                    store.set(
                        "n",
                        Nation {
                            name: format!("N{i}"),
                            capital: "T".into(),
                        },
                    );
                }
            });
        });

        db.flush().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");

        let fresh = Database::new("aurora", dir.path());
        assert_eq!(fresh.define(&TOWNS).unwrap().len(), 300);
        for i in 0..10 {
            let nations = fresh.define_store::<Nation>(&format!("nations-{i}")).unwrap();
            assert_eq!(nations.get("n").unwrap().name, format!("N{i}"));
        }
    }
}
