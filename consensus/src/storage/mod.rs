/// Round-state persistence
///
/// A small key-value store for the fields a node needs to resume its round
/// after a restart. RocksDB backs it in production; an in-memory map
/// backs it in tests.

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub mod checkpoint;

pub use checkpoint::Checkpoint;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub trait RoundStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &[u8]) -> Result<()>;
}

const CF_ROUND_STATE: &str = "round_state";

/// RocksDB-backed round store
pub struct RocksRoundStore {
    db: Arc<DB>,
    // Keeps a temporary directory alive for stores made by `new_temp`
    _temp_dir: Option<tempfile::TempDir>,
}

impl RocksRoundStore {
    /// Open (or create) the store at `path`
    pub fn new(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_ROUND_STATE, Options::default())];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            _temp_dir: None,
        })
    }

    /// Store in a fresh temporary directory, removed on drop
    pub fn new_temp() -> Result<Self> {
        let temp_dir =
            tempfile::tempdir().map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let mut store = Self::new(temp_dir.path())?;
        store._temp_dir = Some(temp_dir);
        Ok(store)
    }

    fn cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_ROUND_STATE)
            .ok_or_else(|| StorageError::InvalidData("Column family not found".into()))
    }
}

impl RoundStore for RocksRoundStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf()?, key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf()?, key)?)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete_cf(self.cf()?, key)?;
        Ok(())
    }
}

/// In-memory round store
#[derive(Default)]
pub struct MemoryRoundStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StorageError {
        StorageError::InvalidData("Store lock poisoned".into())
    }
}

impl RoundStore for MemoryRoundStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn RoundStore) {
        assert_eq!(store.get(b"view").unwrap(), None);
        store.put(b"view", b"one").unwrap();
        store.put(b"view", b"two").unwrap();
        assert_eq!(store.get(b"view").unwrap(), Some(b"two".to_vec()));
        store.delete(b"view").unwrap();
        assert_eq!(store.get(b"view").unwrap(), None);
        // Deleting a missing key is not an error
        store.delete(b"lock_qc").unwrap();
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryRoundStore::new());
    }

    #[test]
    fn test_rocks_store() {
        let store = RocksRoundStore::new_temp().unwrap();
        exercise(&store);
    }

    #[test]
    fn test_rocks_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksRoundStore::new(dir.path()).unwrap();
            store.put(b"high_qc", &[1, 2, 3]).unwrap();
        }
        let store = RocksRoundStore::new(dir.path()).unwrap();
        assert_eq!(store.get(b"high_qc").unwrap(), Some(vec![1, 2, 3]));
    }
}
