//! Channel-scoped index of packets with outstanding fees

use relayfee_core::{ChannelId, PacketId, PortId, RelayFeeError, RelayFeeResult};
use relayfee_state::{StateOverlay, StateStore};

use crate::keys::{index_channel_prefix, index_key, parse_packet_key, INDEX_PREFIX};

/// Set of packet ids that hold at least one undistributed fee record.
///
/// Entries are written in the same overlay as the records they track, so
/// the index and the ledger always commit together.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncentivizedPacketIndex;

impl IncentivizedPacketIndex {
    pub fn add<S: StateStore + ?Sized>(&self, overlay: &mut StateOverlay<S>, packet_id: &PacketId) {
        overlay.set(index_key(packet_id), Vec::new());
    }

    pub fn remove<S: StateStore + ?Sized>(&self, overlay: &mut StateOverlay<S>, packet_id: &PacketId) {
        overlay.delete(index_key(packet_id));
    }

    pub async fn contains<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<bool> {
        overlay.exists(&index_key(packet_id)).await
    }

    /// Indexed packets on one channel end, in sequence order
    pub async fn list_by_channel<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<Vec<PacketId>> {
        Self::collect(overlay, &index_channel_prefix(port_id, channel_id)).await
    }

    pub async fn list_all<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
    ) -> RelayFeeResult<Vec<PacketId>> {
        Self::collect(overlay, INDEX_PREFIX.as_bytes()).await
    }

    async fn collect<S: StateStore + ?Sized>(
        overlay: &StateOverlay<S>,
        prefix: &[u8],
    ) -> RelayFeeResult<Vec<PacketId>> {
        overlay
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .map(|(key, _)| {
                parse_packet_key(INDEX_PREFIX, &key).ok_or_else(|| {
                    RelayFeeError::StateCorruption(format!(
                        "malformed index key {}",
                        String::from_utf8_lossy(&key)
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayfee_core::Sequence;
    use relayfee_state::MemoryStateStore;
    use std::sync::Arc;

    fn packet(channel: u64, sequence: u64) -> PacketId {
        PacketId::new(PortId::transfer(), ChannelId::new(channel), Sequence(sequence))
    }

    #[tokio::test]
    async fn test_list_by_channel_is_scoped_and_ordered() {
        let index = IncentivizedPacketIndex;
        let mut overlay = StateOverlay::new(Arc::new(MemoryStateStore::new()));

        for id in [packet(0, 10), packet(0, 2), packet(1, 1), packet(0, 7)] {
            index.add(&mut overlay, &id);
        }

        let listed = index
            .list_by_channel(&overlay, &PortId::transfer(), &ChannelId::new(0))
            .await
            .unwrap();
        assert_eq!(listed, vec![packet(0, 2), packet(0, 7), packet(0, 10)]);
        assert_eq!(index.list_all(&overlay).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_add_remove() {
        let index = IncentivizedPacketIndex;
        let store = Arc::new(MemoryStateStore::new());
        let mut overlay = StateOverlay::new(store.clone());
        let id = packet(0, 1);

        index.add(&mut overlay, &id);
        index.add(&mut overlay, &id);
        overlay.commit().await.unwrap();

        let mut overlay = StateOverlay::new(store.clone());
        assert!(index.contains(&overlay, &id).await.unwrap());
        index.remove(&mut overlay, &id);
        overlay.commit().await.unwrap();

        let overlay = StateOverlay::new(store);
        assert!(index.list_all(&overlay).await.unwrap().is_empty());
    }
}
