//! Events emitted by committed fee transitions

use parking_lot::Mutex;
use relayfee_core::{Address, Amount, ChannelId, Coin, Denom, PacketId, PortId};
use serde::{Deserialize, Serialize};

use crate::types::{Fee, PayoutKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeEvent {
    /// Totals of a packet after a fee was escrowed for it
    IncentivizedPacket {
        packet_id: PacketId,
        total_fee: Fee,
        records: usize,
    },
    /// A fee was paid ahead of its packet being sent
    FeeQueued {
        packet_id: PacketId,
        fee: Fee,
        payer: Address,
    },
    RegisterPayee {
        channel_id: ChannelId,
        relayer: Address,
        payee: Address,
    },
    RegisterCounterpartyPayee {
        channel_id: ChannelId,
        relayer: Address,
        counterparty_payee: Address,
    },
    DistributeFee {
        packet_id: PacketId,
        receiver: Address,
        fee: Coin,
        kind: PayoutKind,
    },
    RefundFee {
        packet_id: PacketId,
        receiver: Address,
        fee: Coin,
    },
    DistributionFailed {
        packet_id: PacketId,
        reason: String,
    },
    ChannelFeeEnabled {
        port_id: PortId,
        channel_id: ChannelId,
        enabled: bool,
    },
    FeeModuleLocked {
        denom: Denom,
        escrow_balance: Amount,
        outstanding: Amount,
    },
}

/// Buffer of events since the last drain
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<FeeEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: FeeEvent) {
        self.events.lock().push(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = FeeEvent>) {
        self.events.lock().extend(events);
    }

    /// Take every buffered event
    pub fn drain(&self) -> Vec<FeeEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empties_log() {
        let log = EventLog::new();
        log.emit(FeeEvent::DistributionFailed {
            packet_id: PacketId::new(
                PortId::transfer(),
                ChannelId::new(0),
                relayfee_core::Sequence(1),
            ),
            reason: "blocked".into(),
        });
        assert_eq!(log.len(), 1);
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = FeeEvent::RegisterPayee {
            channel_id: ChannelId::new(0),
            relayer: Address::new("relayer1").unwrap(),
            payee: Address::new("payee1").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "register_payee");
        assert_eq!(json["payee"], "payee1");
    }
}
