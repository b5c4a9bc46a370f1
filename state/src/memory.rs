//! In-memory state store for devnet nodes and tests

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use relayfee_core::{
    RelayFeeResult, StateChange, StateMutator, StateProvider, StateRoot, StateVersion,
};
use std::sync::Arc;
use tracing::trace;

use crate::store::{StateEntry, StateStore};

/// In-memory state store
pub struct MemoryStateStore {
    data: DashMap<Vec<u8>, Vec<u8>>,
    version: RwLock<StateVersion>,
    /// Held exclusively while a batch is applied so readers never see half of one
    commit_lock: RwLock<()>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            version: RwLock::new(StateVersion::new(0)),
            commit_lock: RwLock::new(()),
        }
    }

    pub fn with_data(data: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let store = Self::new();
        for (key, value) in data {
            store.data.insert(key, value);
        }
        store
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStateStore {
    fn clone(&self) -> Self {
        let _guard = self.commit_lock.read();
        let new_store = Self::new();
        for entry in self.data.iter() {
            new_store.data.insert(entry.key().clone(), entry.value().clone());
        }
        *new_store.version.write() = *self.version.read();
        new_store
    }
}

#[async_trait]
impl StateProvider for MemoryStateStore {
    async fn version(&self) -> StateVersion {
        *self.version.read()
    }

    async fn root(&self) -> StateRoot {
        self.compute_root().await.unwrap_or(relayfee_core::Hash::ZERO)
    }

    async fn get(&self, key: &[u8]) -> RelayFeeResult<Option<Vec<u8>>> {
        let _guard = self.commit_lock.read();
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn exists(&self, key: &[u8]) -> RelayFeeResult<bool> {
        let _guard = self.commit_lock.read();
        Ok(self.data.contains_key(key))
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> RelayFeeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let _guard = self.commit_lock.read();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[async_trait]
impl StateMutator for MemoryStateStore {
    async fn set(&self, key: &[u8], value: &[u8]) -> RelayFeeResult<()> {
        let _guard = self.commit_lock.write();
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> RelayFeeResult<()> {
        let _guard = self.commit_lock.write();
        self.data.remove(key);
        Ok(())
    }

    async fn apply_batch(&self, changes: Vec<StateChange>) -> RelayFeeResult<StateVersion> {
        let _guard = self.commit_lock.write();
        let count = changes.len();

        for change in changes {
            match change {
                StateChange::Set { key, value } => {
                    self.data.insert(key, value);
                }
                StateChange::Delete { key } => {
                    self.data.remove(&key);
                }
            }
        }

        let mut version = self.version.write();
        *version = version.next();
        trace!("Applied batch of {} changes at {}", count, *version);

        Ok(*version)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn all_entries(&self) -> RelayFeeResult<Vec<StateEntry>> {
        let _guard = self.commit_lock.read();
        let entries: Vec<StateEntry> = self
            .data
            .iter()
            .map(|entry| StateEntry {
                key: entry.key().clone(),
                value: entry.value().clone(),
            })
            .collect();
        Ok(entries)
    }

    async fn len(&self) -> usize {
        self.data.len()
    }
}

/// Thread-safe memory store wrapper
pub type SharedMemoryStateStore = Arc<MemoryStateStore>;

/// Create a shared memory state store
pub fn create_memory_store() -> SharedMemoryStateStore {
    Arc::new(MemoryStateStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStateStore::new();

        store.set(b"key1", b"value1").await.unwrap();
        let value = store.get(b"key1").await.unwrap();
        assert_eq!(value, Some(b"value1".to_vec()));

        store.delete(b"key1").await.unwrap();
        let value = store.get(b"key1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_memory_store_batch() {
        let store = MemoryStateStore::new();

        let changes = vec![
            StateChange::Set {
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            },
            StateChange::Set {
                key: b"k2".to_vec(),
                value: b"v2".to_vec(),
            },
            StateChange::Delete { key: b"k1".to_vec() },
        ];

        let version = store.apply_batch(changes).await.unwrap();
        assert_eq!(version.0, 1);

        assert!(!store.exists(b"k1").await.unwrap());
        assert!(store.exists(b"k2").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered() {
        let store = MemoryStateStore::with_data(vec![
            (b"fee/b".to_vec(), b"2".to_vec()),
            (b"bank/x".to_vec(), b"0".to_vec()),
            (b"fee/a".to_vec(), b"1".to_vec()),
        ]);

        let entries = store.scan_prefix(b"fee/").await.unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"fee/a".as_slice(), b"fee/b".as_slice()]);
    }

    #[tokio::test]
    async fn test_root_tracks_content() {
        let store = MemoryStateStore::new();
        let empty_root = store.root().await;

        store.set(b"k", b"v").await.unwrap();
        assert_ne!(store.root().await, empty_root);
    }
}
