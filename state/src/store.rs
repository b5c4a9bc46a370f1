//! Core state store traits and types

use async_trait::async_trait;
use relayfee_core::{Hash, RelayFeeError, RelayFeeResult, StateMutator, StateProvider, StateRoot};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// State entry for merkle tree computation
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl StateEntry {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.key.len() as u64).to_le_bytes());
        hasher.update(&self.key);
        hasher.update(&self.value);
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Merkle root over leaf hashes; an odd node is paired with itself
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }

    let mut current_level: Vec<Hash> = leaves.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| match chunk {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    current_level[0]
}

/// Compute state root from entries
pub fn compute_state_root(entries: &[StateEntry]) -> StateRoot {
    if entries.is_empty() {
        return Hash::ZERO;
    }

    // Sort entries by key for deterministic ordering
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let leaves: Vec<Hash> = sorted.iter().map(|e| e.hash()).collect();

    merkle_root(&leaves)
}

/// Encode a value for storage
pub fn encode_value<T: Serialize>(value: &T) -> RelayFeeResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RelayFeeError::SerializationError(e.to_string()))
}

/// Decode a stored value
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> RelayFeeResult<T> {
    bincode::deserialize(bytes).map_err(|e| RelayFeeError::DeserializationError(e.to_string()))
}

/// Abstract state store interface
#[async_trait]
pub trait StateStore: StateProvider + StateMutator {
    /// Get all entries for state root computation
    async fn all_entries(&self) -> RelayFeeResult<Vec<StateEntry>>;

    /// Compute current state root
    async fn compute_root(&self) -> RelayFeeResult<StateRoot> {
        let entries = self.all_entries().await?;
        Ok(compute_state_root(&entries))
    }

    /// Number of stored keys
    async fn len(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_root_deterministic() {
        let entries = vec![
            StateEntry {
                key: b"key1".to_vec(),
                value: b"value1".to_vec(),
            },
            StateEntry {
                key: b"key2".to_vec(),
                value: b"value2".to_vec(),
            },
        ];

        let mut reversed = entries.clone();
        reversed.reverse();

        assert_eq!(compute_state_root(&entries), compute_state_root(&reversed));
        assert_ne!(compute_state_root(&entries), Hash::ZERO);
    }

    #[test]
    fn test_state_root_changes_with_value() {
        let a = vec![StateEntry {
            key: b"k".to_vec(),
            value: b"1".to_vec(),
        }];
        let b = vec![StateEntry {
            key: b"k".to_vec(),
            value: b"2".to_vec(),
        }];

        assert_ne!(compute_state_root(&a), compute_state_root(&b));
    }

    #[test]
    fn test_value_codec() {
        let bytes = encode_value(&(7u64, "fee".to_string())).unwrap();
        let decoded: (u64, String) = decode_value(&bytes).unwrap();
        assert_eq!(decoded, (7, "fee".to_string()));

        assert!(decode_value::<u64>(&[1, 2]).is_err());
    }
}
