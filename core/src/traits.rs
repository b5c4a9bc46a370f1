//! Core traits defining relayfee interfaces
//!
//! These traits define the contracts between the fee middleware, the state
//! store it writes into, the base channel it sits on, and the application
//! it wraps.

use crate::channel::{Acknowledgement, ChannelEnd, Counterparty, Order, Packet, Version};
use crate::types::*;
use async_trait::async_trait;

/// Result type for relayfee operations
pub type RelayFeeResult<T> = Result<T, crate::error::RelayFeeError>;

/// State provider trait
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Get the current state version
    async fn version(&self) -> StateVersion;

    /// Get the state root hash
    async fn root(&self) -> StateRoot;

    /// Get a value by key
    async fn get(&self, key: &[u8]) -> RelayFeeResult<Option<Vec<u8>>>;

    /// Check if a key exists
    async fn exists(&self, key: &[u8]) -> RelayFeeResult<bool>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &[u8]) -> RelayFeeResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// State mutator trait
#[async_trait]
pub trait StateMutator: StateProvider {
    /// Set a value
    async fn set(&self, key: &[u8], value: &[u8]) -> RelayFeeResult<()>;

    /// Delete a key
    async fn delete(&self, key: &[u8]) -> RelayFeeResult<()>;

    /// Apply a batch of changes atomically
    async fn apply_batch(&self, changes: Vec<StateChange>) -> RelayFeeResult<StateVersion>;
}

/// State change operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Read access to the base channel the middleware sits on.
///
/// The fee module never mutates channel state. It only needs to know
/// whether a channel exists and whether a given packet is still in flight.
#[async_trait]
pub trait ChannelKeeper: Send + Sync {
    /// Channel end stored for `port_id/channel_id`
    async fn channel(&self, port_id: &PortId, channel_id: &ChannelId) -> Option<ChannelEnd>;

    /// Sequence the next sent packet on this channel end will receive
    async fn next_sequence_send(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<Sequence>;

    /// Whether the packet commitment still exists (sent, not yet acked or timed out)
    async fn has_packet_commitment(&self, packet_id: &PacketId) -> bool;
}

/// Packet lifecycle callbacks of an application bound to a port.
///
/// Middleware implements this trait by holding the wrapped module and
/// delegating to it before running its own logic.
#[async_trait]
pub trait PacketModule: Send + Sync {
    /// Called on the sending chain after the packet commitment is written.
    /// An error rolls the send back.
    async fn on_send_packet(&self, _packet: &Packet) -> RelayFeeResult<()> {
        Ok(())
    }

    /// Called on the receiving chain; returns the acknowledgement to write
    async fn on_recv_packet(&self, packet: &Packet, relayer: &Address) -> Acknowledgement;

    /// Called on the sending chain when the acknowledgement is proven
    async fn on_acknowledgement_packet(
        &self,
        packet: &Packet,
        acknowledgement: &Acknowledgement,
        relayer: &Address,
    ) -> RelayFeeResult<()>;

    /// Called on the sending chain when non-delivery is proven
    async fn on_timeout_packet(&self, packet: &Packet, relayer: &Address) -> RelayFeeResult<()>;
}

/// Channel handshake callbacks. Defaults accept the proposed version unchanged.
#[async_trait]
pub trait ChannelModule: Send + Sync {
    async fn on_chan_open_init(
        &self,
        _order: Order,
        _port_id: &PortId,
        _channel_id: &ChannelId,
        _counterparty: &Counterparty,
        version: &Version,
    ) -> RelayFeeResult<Version> {
        Ok(version.clone())
    }

    async fn on_chan_open_try(
        &self,
        _order: Order,
        _port_id: &PortId,
        _channel_id: &ChannelId,
        _counterparty: &Counterparty,
        counterparty_version: &Version,
    ) -> RelayFeeResult<Version> {
        Ok(counterparty_version.clone())
    }

    async fn on_chan_open_ack(
        &self,
        _port_id: &PortId,
        _channel_id: &ChannelId,
        _counterparty_version: &Version,
    ) -> RelayFeeResult<()> {
        Ok(())
    }

    async fn on_chan_open_confirm(&self, _port_id: &PortId, _channel_id: &ChannelId) -> RelayFeeResult<()> {
        Ok(())
    }

    async fn on_chan_close_init(&self, _port_id: &PortId, _channel_id: &ChannelId) -> RelayFeeResult<()> {
        Ok(())
    }

    async fn on_chan_close_confirm(&self, _port_id: &PortId, _channel_id: &ChannelId) -> RelayFeeResult<()> {
        Ok(())
    }
}
