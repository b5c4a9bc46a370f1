//! Write-staging overlay over a state store
//!
//! Every state transition runs against an overlay: reads fall through to
//! the underlying store, writes stay local until [`StateOverlay::commit`]
//! applies them as one batch. Dropping the overlay discards them.
//! Checkpoints allow a sub-step to be undone without losing earlier writes.

use relayfee_core::{RelayFeeResult, StateChange, StateVersion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::store::{decode_value, encode_value, StateStore};

/// Snapshot of staged writes taken by [`StateOverlay::checkpoint`]
#[derive(Debug, Clone)]
pub struct Checkpoint(BTreeMap<Vec<u8>, Option<Vec<u8>>>);

/// Staged writes on top of a store
pub struct StateOverlay<S: StateStore + ?Sized> {
    base: Arc<S>,
    /// `None` marks a staged delete
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<S: StateStore + ?Sized> StateOverlay<S> {
    pub fn new(base: Arc<S>) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub async fn get(&self, key: &[u8]) -> RelayFeeResult<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.get(key).await,
        }
    }

    pub async fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> RelayFeeResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, key: &[u8]) -> RelayFeeResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn set_value<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> RelayFeeResult<()> {
        self.set(key, encode_value(value)?);
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// Entries under `prefix` as seen through the staged writes, ordered by key
    pub async fn scan_prefix(&self, prefix: &[u8]) -> RelayFeeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.scan_prefix(prefix).await?.into_iter().collect();

        for (key, staged) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.writes.clone())
    }

    /// Discard every write staged after `checkpoint` was taken
    pub fn revert(&mut self, checkpoint: Checkpoint) {
        self.writes = checkpoint.0;
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_changes(self) -> Vec<StateChange> {
        self.writes
            .into_iter()
            .map(|(key, staged)| match staged {
                Some(value) => StateChange::Set { key, value },
                None => StateChange::Delete { key },
            })
            .collect()
    }

    /// Apply all staged writes to the store as one batch
    pub async fn commit(self) -> RelayFeeResult<StateVersion> {
        let base = self.base.clone();
        if self.writes.is_empty() {
            return Ok(base.version().await);
        }
        base.apply_batch(self.into_changes()).await
    }
}
