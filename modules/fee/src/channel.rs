//! In-memory base channel
//!
//! A minimal channel keeper for devnet nodes and tests: channel ends,
//! send sequences, packet commitments, receipts and written
//! acknowledgements. Proof verification is out of scope; callers are
//! trusted to relay packets that the counterparty really produced.

use async_trait::async_trait;
use parking_lot::RwLock;
use relayfee_core::{
    Acknowledgement, ChannelEnd, ChannelId, ChannelKeeper, ChannelState, Counterparty, Order,
    Packet, PacketId, PortId, RelayFeeError, RelayFeeResult, Sequence, Timestamp, Version,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Default)]
struct ChannelStore {
    channels: BTreeMap<(PortId, ChannelId), ChannelEnd>,
    next_sequence_send: HashMap<(PortId, ChannelId), Sequence>,
    commitments: HashMap<PacketId, Packet>,
    receipts: HashSet<PacketId>,
    acknowledgements: HashMap<PacketId, Acknowledgement>,
    channel_counter: u64,
}

#[derive(Default)]
pub struct InMemoryChannelKeeper {
    inner: RwLock<ChannelStore>,
}

impl InMemoryChannelKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(port_id: &PortId, channel_id: &ChannelId) -> RelayFeeError {
        RelayFeeError::ChannelNotFound {
            port_id: port_id.clone(),
            channel_id: channel_id.clone(),
        }
    }

    /// Allocate the next channel identifier and store a new channel end
    pub fn create_channel(
        &self,
        port_id: &PortId,
        state: ChannelState,
        ordering: Order,
        counterparty: Counterparty,
        version: Version,
    ) -> ChannelId {
        let mut inner = self.inner.write();
        let channel_id = ChannelId::new(inner.channel_counter);
        inner.channel_counter += 1;

        inner.channels.insert(
            (port_id.clone(), channel_id.clone()),
            ChannelEnd {
                state,
                ordering,
                counterparty,
                version,
            },
        );
        inner
            .next_sequence_send
            .insert((port_id.clone(), channel_id.clone()), Sequence(1));

        debug!("Created channel {}/{} in state {:?}", port_id, channel_id, state);
        channel_id
    }

    /// Apply `update` to a stored channel end
    pub fn update_channel(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        update: impl FnOnce(&mut ChannelEnd),
    ) -> RelayFeeResult<ChannelEnd> {
        let mut inner = self.inner.write();
        let channel = inner
            .channels
            .get_mut(&(port_id.clone(), channel_id.clone()))
            .ok_or_else(|| Self::not_found(port_id, channel_id))?;
        update(channel);
        Ok(channel.clone())
    }

    pub fn channels(&self) -> Vec<(PortId, ChannelId, ChannelEnd)> {
        self.inner
            .read()
            .channels
            .iter()
            .map(|((port, chan), end)| (port.clone(), chan.clone(), end.clone()))
            .collect()
    }

    /// Assign the next sequence and write the packet commitment
    pub fn send_packet(
        &self,
        source_port: &PortId,
        source_channel: &ChannelId,
        data: Vec<u8>,
        timeout_timestamp: Timestamp,
    ) -> RelayFeeResult<Packet> {
        let mut inner = self.inner.write();
        let key = (source_port.clone(), source_channel.clone());

        let channel = inner
            .channels
            .get(&key)
            .ok_or_else(|| Self::not_found(source_port, source_channel))?;
        channel.ensure_open(source_port, source_channel)?;
        let destination_channel = channel.counterparty.channel_id.clone().ok_or_else(|| {
            RelayFeeError::InvalidIdentifier(format!(
                "channel {source_port}/{source_channel} has no counterparty channel"
            ))
        })?;
        let destination_port = channel.counterparty.port_id.clone();

        let sequence = inner
            .next_sequence_send
            .get(&key)
            .copied()
            .unwrap_or(Sequence(1));
        inner.next_sequence_send.insert(key, sequence.next());

        let packet = Packet {
            sequence,
            source_port: source_port.clone(),
            source_channel: source_channel.clone(),
            destination_port,
            destination_channel,
            data,
            timeout_timestamp,
        };
        inner.commitments.insert(packet.source_id(), packet.clone());

        debug!("Sent packet {}", packet.source_id());
        Ok(packet)
    }

    /// Undo `send_packet` after the bound module rejected the packet. The
    /// sequence is handed back unless a later send already claimed the next one.
    pub fn abort_send(&self, packet: &Packet) {
        let mut inner = self.inner.write();
        inner.commitments.remove(&packet.source_id());

        let key = (packet.source_port.clone(), packet.source_channel.clone());
        if inner.next_sequence_send.get(&key) == Some(&packet.sequence.next()) {
            inner.next_sequence_send.insert(key, packet.sequence);
        }
        debug!("Aborted send of {}", packet.source_id());
    }

    /// Record the receipt of `packet` on its destination channel
    pub fn recv_packet(&self, packet: &Packet, now: Timestamp) -> RelayFeeResult<()> {
        let mut inner = self.inner.write();
        let id = packet.destination_id();

        let channel = inner
            .channels
            .get(&(id.port_id.clone(), id.channel_id.clone()))
            .ok_or_else(|| Self::not_found(&id.port_id, &id.channel_id))?;
        channel.ensure_open(&id.port_id, &id.channel_id)?;

        if packet.timed_out_at(now) {
            return Err(RelayFeeError::PacketTimedOut(id));
        }
        if !inner.receipts.insert(id.clone()) {
            return Err(RelayFeeError::PacketAlreadyReceived(id));
        }
        Ok(())
    }

    pub fn write_acknowledgement(&self, packet: &Packet, ack: Acknowledgement) {
        self.inner
            .write()
            .acknowledgements
            .insert(packet.destination_id(), ack);
    }

    /// Acknowledgement written for a packet received on this chain
    pub fn acknowledgement(&self, destination_id: &PacketId) -> Option<Acknowledgement> {
        self.inner.read().acknowledgements.get(destination_id).cloned()
    }

    /// Stored packet for an outstanding commitment
    pub fn packet_commitment(&self, source_id: &PacketId) -> Option<Packet> {
        self.inner.read().commitments.get(source_id).cloned()
    }

    pub fn ensure_commitment(&self, packet: &Packet) -> RelayFeeResult<()> {
        let id = packet.source_id();
        match self.inner.read().commitments.get(&id) {
            Some(stored) if stored == packet => Ok(()),
            _ => Err(RelayFeeError::PacketCommitmentNotFound(id)),
        }
    }

    pub fn ensure_timed_out(&self, packet: &Packet, now: Timestamp) -> RelayFeeResult<()> {
        self.ensure_commitment(packet)?;
        if !packet.timed_out_at(now) {
            return Err(RelayFeeError::PacketNotTimedOut(packet.source_id()));
        }
        Ok(())
    }

    pub fn delete_commitment(&self, source_id: &PacketId) {
        self.inner.write().commitments.remove(source_id);
    }

    /// Outstanding commitments on one channel end, in sequence order
    pub fn pending_packets(&self, port_id: &PortId, channel_id: &ChannelId) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self
            .inner
            .read()
            .commitments
            .values()
            .filter(|p| &p.source_port == port_id && &p.source_channel == channel_id)
            .cloned()
            .collect();
        packets.sort_by_key(|p| p.sequence);
        packets
    }
}

#[async_trait]
impl ChannelKeeper for InMemoryChannelKeeper {
    async fn channel(&self, port_id: &PortId, channel_id: &ChannelId) -> Option<ChannelEnd> {
        self.inner
            .read()
            .channels
            .get(&(port_id.clone(), channel_id.clone()))
            .cloned()
    }

    async fn next_sequence_send(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<Sequence> {
        self.inner
            .read()
            .next_sequence_send
            .get(&(port_id.clone(), channel_id.clone()))
            .copied()
            .ok_or_else(|| Self::not_found(port_id, channel_id))
    }

    async fn has_packet_commitment(&self, packet_id: &PacketId) -> bool {
        self.inner.read().commitments.contains_key(packet_id)
    }
}
