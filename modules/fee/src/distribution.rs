//! Turning escrowed fee records into payouts
//!
//! Planning is pure: given a record and how the packet ended, it decides who
//! receives which portion. Anything not earned goes back to the payer in a
//! single refund. [`FeeDistributor`] resolves payout addresses and hands the
//! outcome to the escrow ledger, which performs the transfers.

use relayfee_core::{Address, Amount, PacketId, RelayFeeResult};
use relayfee_state::{StateOverlay, StateStore};
use tracing::debug;

use crate::escrow::FeeEscrowLedger;
use crate::payee::PayeeRegistry;
use crate::types::{PacketFee, PacketOutcome, Payout, PayoutKind, SettlementReport};

struct PayoutPlan<'a> {
    record: &'a PacketFee,
    payouts: Vec<Payout>,
    refund: Amount,
}

impl<'a> PayoutPlan<'a> {
    fn new(record: &'a PacketFee) -> Self {
        Self {
            record,
            payouts: Vec::new(),
            refund: Amount::ZERO,
        }
    }

    /// Pay `amount` to `recipient` when `earner` may earn this record, refund otherwise
    fn award(&mut self, earner: Option<&Address>, recipient: &Address, amount: Amount, kind: PayoutKind) {
        match earner {
            Some(earner) if self.record.is_eligible(earner) => {
                if !amount.is_zero() {
                    self.payouts
                        .push(Payout::new(recipient.clone(), self.record.fee.coin(amount), kind));
                }
            }
            _ => self.refund(amount),
        }
    }

    fn refund(&mut self, amount: Amount) {
        self.refund = self.refund.saturating_add(amount);
    }

    fn finish(mut self) -> Vec<Payout> {
        if !self.refund.is_zero() {
            self.payouts.push(Payout::new(
                self.record.refund_address.clone(),
                self.record.fee.coin(self.refund),
                PayoutKind::Refund,
            ));
        }
        self.payouts
    }
}

/// Payouts for one record given the packet outcome
pub fn plan_payouts(record: &PacketFee, outcome: &PacketOutcome) -> Vec<Payout> {
    let fee = &record.fee;
    let mut plan = PayoutPlan::new(record);

    match outcome {
        PacketOutcome::Acknowledged {
            forward_relayer,
            reverse_relayer,
            reverse_payee,
        } => {
            if let Some(forward) = forward_relayer {
                plan.award(Some(forward), forward, fee.recv_fee, PayoutKind::RecvFee);
            } else {
                plan.refund(fee.recv_fee);
            }
            plan.award(Some(reverse_relayer), reverse_payee, fee.ack_fee, PayoutKind::AckFee);
            plan.refund(fee.timeout_fee);
        }
        PacketOutcome::TimedOut { relayer, payee } => {
            plan.award(Some(relayer), payee, fee.timeout_fee, PayoutKind::TimeoutFee);
            plan.refund(fee.recv_fee);
            plan.refund(fee.ack_fee);
        }
    }

    plan.finish()
}

/// Payouts returning the whole record to its payer
pub fn plan_refund(record: &PacketFee) -> Vec<Payout> {
    let mut plan = PayoutPlan::new(record);
    plan.refund(record.fee.recv_fee);
    plan.refund(record.fee.ack_fee);
    plan.refund(record.fee.timeout_fee);
    plan.finish()
}

/// Resolves relayer payout addresses and settles a packet's records
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeDistributor {
    payees: PayeeRegistry,
}

impl FeeDistributor {
    pub fn new(payees: PayeeRegistry) -> Self {
        Self { payees }
    }

    /// Settle after a successful acknowledgement. `forward_relayer` is the
    /// address reported by the receiving chain, already resolved to a payee
    /// there.
    pub async fn distribute_on_acknowledgement<S: StateStore + ?Sized>(
        &self,
        ledger: &FeeEscrowLedger,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        forward_relayer: Option<Address>,
        reverse_relayer: &Address,
    ) -> RelayFeeResult<SettlementReport> {
        let reverse_payee = self
            .payees
            .resolve_payee(overlay, &packet_id.channel_id, reverse_relayer)
            .await;
        debug!(
            "Distributing fees for {}: forward={:?} reverse={} payee={}",
            packet_id, forward_relayer, reverse_relayer, reverse_payee
        );

        let outcome = PacketOutcome::Acknowledged {
            forward_relayer,
            reverse_relayer: reverse_relayer.clone(),
            reverse_payee,
        };
        ledger.release_for_distribution(overlay, packet_id, &outcome).await
    }

    pub async fn distribute_on_timeout<S: StateStore + ?Sized>(
        &self,
        ledger: &FeeEscrowLedger,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        relayer: &Address,
    ) -> RelayFeeResult<SettlementReport> {
        let payee = self
            .payees
            .resolve_payee(overlay, &packet_id.channel_id, relayer)
            .await;
        debug!("Distributing timeout fees for {}: relayer={} payee={}", packet_id, relayer, payee);

        let outcome = PacketOutcome::TimedOut {
            relayer: relayer.clone(),
            payee,
        };
        ledger.release_for_distribution(overlay, packet_id, &outcome).await
    }
}
