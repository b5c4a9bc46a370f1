//! Fee module transactions
//!
//! Message bodies as submitted by users and relayers. Identity is taken at
//! face value; signature checks belong to the host chain.

use relayfee_core::{Address, ChannelId, PacketId, PortId};
use serde::{Deserialize, Serialize};

use crate::types::{Fee, PacketFee};

/// Pay a fee for a packet that is already in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPayPacketFee {
    pub packet_id: PacketId,
    pub fee: Fee,
    /// Payer and refund address
    pub signer: Address,
    /// Relayers allowed to earn the fee; empty means anyone
    #[serde(default)]
    pub relayers: Vec<Address>,
}

impl MsgPayPacketFee {
    pub fn into_packet_fee(self) -> (PacketId, PacketFee) {
        (
            self.packet_id,
            PacketFee::new(self.fee, self.signer, self.relayers),
        )
    }
}

/// Pay a fee for a packet that may not have been sent yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPayPacketFeeAsync {
    pub packet_id: PacketId,
    pub packet_fee: PacketFee,
}

/// Register where a relayer on this chain is paid ack and timeout fees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRegisterPayee {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub relayer: Address,
    pub payee: Address,
}

/// Register the counterparty chain address a relayer is paid receive fees at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRegisterCounterpartyPayee {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub relayer: Address,
    pub counterparty_payee: Address,
}

/// Outcome of a fee payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeReceipt {
    pub packet_id: PacketId,
    pub packet_fee: PacketFee,
    /// The packet was not sent yet; the record activates when it is
    pub queued: bool,
}
