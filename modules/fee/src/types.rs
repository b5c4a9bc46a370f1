//! Fee records and distribution outcomes

use relayfee_core::{
    Address, Amount, ChannelId, Coin, Denom, PacketId, PortId, RelayFeeError, RelayFeeResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fees offered for relaying one packet, all in one denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub denom: Denom,
    /// Paid to the relayer that delivers the packet to the destination
    pub recv_fee: Amount,
    /// Paid to the relayer that brings the acknowledgement back
    pub ack_fee: Amount,
    /// Paid to the relayer that proves the packet timed out
    pub timeout_fee: Amount,
}

impl Fee {
    pub fn new(denom: Denom, recv_fee: Amount, ack_fee: Amount, timeout_fee: Amount) -> Self {
        Self {
            denom,
            recv_fee,
            ack_fee,
            timeout_fee,
        }
    }

    pub fn zero(denom: Denom) -> Self {
        Self::new(denom, Amount::ZERO, Amount::ZERO, Amount::ZERO)
    }

    /// Amount escrowed for this fee: `recv + ack + timeout`
    pub fn total(&self) -> RelayFeeResult<Amount> {
        self.recv_fee
            .checked_add(self.ack_fee)
            .and_then(|sum| sum.checked_add(self.timeout_fee))
            .ok_or_else(|| RelayFeeError::InvalidFee("fee total overflows".into()))
    }

    pub fn is_zero(&self) -> bool {
        self.recv_fee.is_zero() && self.ack_fee.is_zero() && self.timeout_fee.is_zero()
    }

    /// Component-wise sum of two fees of the same denomination
    pub fn checked_add(&self, other: &Fee) -> RelayFeeResult<Fee> {
        if self.denom != other.denom {
            return Err(RelayFeeError::DenomMismatch {
                expected: self.denom.to_string(),
                got: other.denom.to_string(),
            });
        }

        let overflow = || RelayFeeError::InvalidFee("fee sum overflows".into());
        Ok(Fee {
            denom: self.denom.clone(),
            recv_fee: self.recv_fee.checked_add(other.recv_fee).ok_or_else(overflow)?,
            ack_fee: self.ack_fee.checked_add(other.ack_fee).ok_or_else(overflow)?,
            timeout_fee: self
                .timeout_fee
                .checked_add(other.timeout_fee)
                .ok_or_else(overflow)?,
        })
    }

    pub fn coin(&self, amount: Amount) -> Coin {
        Coin::new(self.denom.clone(), amount)
    }
}

impl fmt::Display for Fee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recv={} ack={} timeout={} {}",
            self.recv_fee, self.ack_fee, self.timeout_fee, self.denom
        )
    }
}

/// One escrowed fee record. Records on the same packet are additive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFee {
    pub fee: Fee,
    /// Payer; receives every portion that is not earned
    pub refund_address: Address,
    /// Relayers allowed to earn this record; empty means anyone
    pub relayers: Vec<Address>,
}

impl PacketFee {
    pub fn new(fee: Fee, refund_address: Address, relayers: Vec<Address>) -> Self {
        Self {
            fee,
            refund_address,
            relayers,
        }
    }

    pub fn is_eligible(&self, relayer: &Address) -> bool {
        self.relayers.is_empty() || self.relayers.contains(relayer)
    }
}

/// Sum of a packet's fee records; `None` when there are none
pub fn total_fee(records: &[PacketFee]) -> RelayFeeResult<Option<Fee>> {
    let mut iter = records.iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };

    let mut total = first.fee.clone();
    for record in iter {
        total = total.checked_add(&record.fee)?;
    }
    Ok(Some(total))
}

/// Query view of a packet with outstanding fees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncentivizedPacket {
    pub packet_id: PacketId,
    pub total_fee: Fee,
    pub packet_fees: Vec<PacketFee>,
}

impl IncentivizedPacket {
    pub fn from_records(packet_id: PacketId, packet_fees: Vec<PacketFee>) -> RelayFeeResult<Option<Self>> {
        Ok(total_fee(&packet_fees)?.map(|total_fee| Self {
            packet_id,
            total_fee,
            packet_fees,
        }))
    }
}

/// Fee lifecycle of a packet. `NoFee` is the absence of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketFeeStatus {
    FeesEscrowed,
    Distributed,
    Refunded,
}

impl PacketFeeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PacketFeeStatus::Distributed | PacketFeeStatus::Refunded)
    }
}

/// How a packet was resolved on the sending chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    Acknowledged {
        /// Address carried back in the acknowledgement; `None` when the
        /// receiving side did not report one
        forward_relayer: Option<Address>,
        reverse_relayer: Address,
        /// Where `reverse_relayer` wants to be paid
        reverse_payee: Address,
    },
    TimedOut {
        relayer: Address,
        payee: Address,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    RecvFee,
    AckFee,
    TimeoutFee,
    Refund,
}

/// One transfer out of escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub recipient: Address,
    pub coin: Coin,
    pub kind: PayoutKind,
}

impl Payout {
    pub fn new(recipient: Address, coin: Coin, kind: PayoutKind) -> Self {
        Self {
            recipient,
            coin,
            kind,
        }
    }
}

/// Result of settling a packet's records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub payouts: Vec<Payout>,
    /// Records whose payouts failed; they stay escrowed
    pub retained: Vec<PacketFee>,
}

impl SettlementReport {
    pub fn is_complete(&self) -> bool {
        self.retained.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeEnabledChannel {
    pub port_id: PortId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPayee {
    pub channel_id: ChannelId,
    pub relayer: Address,
    pub payee: Address,
}

/// Escrow audit for one denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAudit {
    pub denom: Denom,
    pub escrow_balance: Amount,
    pub outstanding: Amount,
}

impl EscrowAudit {
    pub fn is_covered(&self) -> bool {
        self.escrow_balance >= self.outstanding
    }
}
