// Storage abstraction for key/value persistence

use crate::error::{MixerError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Ordered byte-keyed store the persistence layer is built on
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &[u8]) -> Result<()>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize>;
    fn flush(&self) -> Result<()>;
}

fn storage_error(err: impl std::fmt::Display) -> MixerError {
    MixerError::collaborator("storage", err)
}

/// In-memory storage for tests and simulations
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sled-backed storage surviving restarts
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(storage_error)?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value).map_err(storage_error)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.db.get(key).map_err(storage_error)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key).map_err(storage_error)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(storage_error)?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(storage: &dyn StorageBackend) {
        storage.put(b"req/1", b"one").unwrap();
        storage.put(b"req/2", b"two").unwrap();
        storage.put(b"op/1", b"three").unwrap();

        assert_eq!(storage.get(b"req/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(storage.count_prefix(b"req/").unwrap(), 2);
        let scanned = storage.scan_prefix(b"req/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(scanned.iter().all(|(k, _)| k.starts_with(b"req/")));

        storage.remove(b"req/1").unwrap();
        assert_eq!(storage.get(b"req/1").unwrap(), None);
        assert_eq!(storage.count_prefix(b"req/").unwrap(), 1);
        storage.flush().unwrap();
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempdir().unwrap();
        let storage = SledStorage::open(dir.path().join("db")).unwrap();
        exercise(&storage);
    }

    #[test]
    fn test_sled_storage_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let storage = SledStorage::open(&path).unwrap();
            storage.put(b"entry/x", b"value").unwrap();
            storage.flush().unwrap();
        }
        let reopened = SledStorage::open(&path).unwrap();
        assert_eq!(reopened.get(b"entry/x").unwrap(), Some(b"value".to_vec()));
    }
}
