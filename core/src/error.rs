//! Error types for relayfee

use crate::types::{ChannelId, PacketId, PortId};
use thiserror::Error;

/// Main error type for relayfee
#[derive(Error, Debug)]
pub enum RelayFeeError {
    // ============ Fee Errors ============
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u128, available: u128 },

    #[error("Packet not found: {0}")]
    PacketNotFound(PacketId),

    #[error("Packet already resolved: {0}")]
    PacketAlreadyResolved(PacketId),

    #[error("No fees in escrow for packet {0}")]
    NoFeesInEscrow(PacketId),

    #[error("Payee resolution failed: {0}")]
    PayeeResolutionFailed(String),

    #[error("Channel {port_id}/{channel_id} is not fee enabled")]
    ChannelNotFeeEnabled { port_id: PortId, channel_id: ChannelId },

    #[error("Invalid fee: {0}")]
    InvalidFee(String),

    #[error("Fee denomination mismatch: expected {expected}, got {got}")]
    DenomMismatch { expected: String, got: String },

    #[error("Too many fee records for packet {packet_id}: maximum {max}")]
    TooManyFeeRecords { packet_id: PacketId, max: usize },

    #[error("Fee module is locked: escrow balance does not cover outstanding fees")]
    FeeModuleLocked,

    #[error("Transfer to blocked address {0}")]
    TransferBlocked(String),

    #[error("Invalid acknowledgement: {0}")]
    InvalidAcknowledgement(String),

    #[error("Invalid channel version: {0}")]
    InvalidVersion(String),

    // ============ Channel Errors ============
    #[error("Channel not found: {port_id}/{channel_id}")]
    ChannelNotFound { port_id: PortId, channel_id: ChannelId },

    #[error("Channel closed: {port_id}/{channel_id}")]
    ChannelClosed { port_id: PortId, channel_id: ChannelId },

    #[error("Packet commitment not found for {0}")]
    PacketCommitmentNotFound(PacketId),

    #[error("Packet already received: {0}")]
    PacketAlreadyReceived(PacketId),

    #[error("Packet {0} has not timed out yet")]
    PacketNotTimedOut(PacketId),

    #[error("Packet {0} timed out before it was received")]
    PacketTimedOut(PacketId),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Application callback failed: {0}")]
    ApplicationError(String),

    // ============ State Errors ============
    #[error("State not found for key")]
    StateNotFound,

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // ============ Serialization Errors ============
    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(String),

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for RelayFeeError {
    fn from(err: std::io::Error) -> Self {
        RelayFeeError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for RelayFeeError {
    fn from(err: bincode::Error) -> Self {
        RelayFeeError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for RelayFeeError {
    fn from(err: serde_json::Error) -> Self {
        RelayFeeError::SerializationError(err.to_string())
    }
}
