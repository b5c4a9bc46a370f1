//! Fee escrow ledger
//!
//! Holds the fee records of every packet and the coins backing them in the
//! escrow module account. The account balance always equals the sum of all
//! records, active and queued. Records are only appended; each one leaves
//! the ledger exactly once, through distribution or refund.

use relayfee_core::{Address, Amount, Denom, PacketId, RelayFeeError, RelayFeeResult};
use relayfee_state::{StateOverlay, StateStore};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::bank::Bank;
use crate::distribution::{plan_payouts, plan_refund};
use crate::index::IncentivizedPacketIndex;
use crate::keys::{
    packet_fees_key, packet_status_key, parse_packet_key, queued_fees_key, PACKET_FEES_PREFIX,
    QUEUED_FEES_PREFIX,
};
use crate::types::{PacketFee, PacketFeeStatus, PacketOutcome, Payout, SettlementReport};

pub struct FeeEscrowLedger {
    escrow_account: Address,
    max_records: usize,
    bank: Bank,
    index: IncentivizedPacketIndex,
}

impl FeeEscrowLedger {
    pub fn new(escrow_account: Address, max_records: usize, bank: Bank) -> Self {
        Self {
            escrow_account,
            max_records,
            bank,
            index: IncentivizedPacketIndex,
        }
    }

    pub fn escrow_account(&self) -> &Address {
        &self.escrow_account
    }

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    /// Active fee records of a packet
    pub async fn packet_fees<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<Vec<PacketFee>> {
        Ok(overlay
            .get_value(&packet_fees_key(packet_id))
            .await?
            .unwrap_or_default())
    }

    /// Records paid ahead of the packet being sent
    pub async fn queued_fees<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<Vec<PacketFee>> {
        Ok(overlay
            .get_value(&queued_fees_key(packet_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn status<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<Option<PacketFeeStatus>> {
        overlay.get_value(&packet_status_key(packet_id)).await
    }

    fn write_records<S: StateStore + ?Sized>(
        overlay: &mut StateOverlay<S>,
        key: Vec<u8>,
        records: &[PacketFee],
    ) -> RelayFeeResult<()> {
        if records.is_empty() {
            overlay.delete(key);
            Ok(())
        } else {
            overlay.set_value(key, &records.to_vec())
        }
    }

    fn set_status<S: StateStore + ?Sized>(
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        status: PacketFeeStatus,
    ) -> RelayFeeResult<()> {
        overlay.set_value(packet_status_key(packet_id), &status)
    }

    async fn ensure_not_resolved<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<()> {
        match self.status(overlay, packet_id).await? {
            Some(status) if status.is_terminal() => {
                Err(RelayFeeError::PacketAlreadyResolved(packet_id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// All records of one packet share the first record's denomination
    fn check_append(&self, packet_id: &PacketId, existing: &[PacketFee], new: &PacketFee) -> RelayFeeResult<()> {
        if existing.len() >= self.max_records {
            return Err(RelayFeeError::TooManyFeeRecords {
                packet_id: packet_id.clone(),
                max: self.max_records,
            });
        }
        if let Some(first) = existing.first() {
            if first.fee.denom != new.fee.denom {
                return Err(RelayFeeError::DenomMismatch {
                    expected: first.fee.denom.to_string(),
                    got: new.fee.denom.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn lock_funds<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_fee: &PacketFee,
    ) -> RelayFeeResult<Amount> {
        let payer = &packet_fee.refund_address;
        if payer == &self.escrow_account || self.bank.is_blocked(payer) {
            return Err(RelayFeeError::TransferBlocked(payer.to_string()));
        }

        let total = packet_fee.fee.total()?;
        if total.is_zero() {
            return Err(RelayFeeError::InvalidFee("fee total must be positive".into()));
        }
        self.bank
            .send(
                overlay,
                &packet_fee.refund_address,
                &self.escrow_account,
                &packet_fee.fee.coin(total),
            )
            .await?;
        Ok(total)
    }

    /// Debit the payer and append an active record for an in-flight packet
    pub async fn escrow_fee<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        packet_fee: PacketFee,
    ) -> RelayFeeResult<PacketFee> {
        self.ensure_not_resolved(overlay, packet_id).await?;

        let mut records = self.packet_fees(overlay, packet_id).await?;
        self.check_append(packet_id, &records, &packet_fee)?;
        let total = self.lock_funds(overlay, &packet_fee).await?;

        records.push(packet_fee.clone());
        Self::write_records(overlay, packet_fees_key(packet_id), &records)?;
        Self::set_status(overlay, packet_id, PacketFeeStatus::FeesEscrowed)?;
        self.index.add(overlay, packet_id);

        info!(
            "Escrowed {} for {} from {} ({} records)",
            packet_fee.fee.coin(total),
            packet_id,
            packet_fee.refund_address,
            records.len()
        );
        Ok(packet_fee)
    }

    /// Debit the payer for a packet that has not been sent yet. The record
    /// stays queued until [`FeeEscrowLedger::activate_queued`].
    pub async fn queue_fee<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        packet_fee: PacketFee,
    ) -> RelayFeeResult<PacketFee> {
        self.ensure_not_resolved(overlay, packet_id).await?;

        let mut queued = self.queued_fees(overlay, packet_id).await?;
        self.check_append(packet_id, &queued, &packet_fee)?;
        let total = self.lock_funds(overlay, &packet_fee).await?;

        queued.push(packet_fee.clone());
        Self::write_records(overlay, queued_fees_key(packet_id), &queued)?;

        info!(
            "Queued {} for unsent packet {} from {}",
            packet_fee.fee.coin(total),
            packet_id,
            packet_fee.refund_address
        );
        Ok(packet_fee)
    }

    /// Move queued records into the active ledger once the packet is sent.
    /// Funds were locked when the records were queued.
    pub async fn activate_queued<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<Vec<PacketFee>> {
        let queued = self.queued_fees(overlay, packet_id).await?;
        if queued.is_empty() {
            return Ok(queued);
        }

        let mut records = self.packet_fees(overlay, packet_id).await?;
        records.extend(queued.iter().cloned());
        Self::write_records(overlay, packet_fees_key(packet_id), &records)?;
        overlay.delete(queued_fees_key(packet_id));
        Self::set_status(overlay, packet_id, PacketFeeStatus::FeesEscrowed)?;
        self.index.add(overlay, packet_id);

        debug!("Activated {} queued fee records for {}", queued.len(), packet_id);
        Ok(queued)
    }

    /// Write exported records back without moving funds. The escrow account
    /// balance is restored with the other genesis balances.
    pub fn restore_records<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        records: &[PacketFee],
        queued: bool,
    ) -> RelayFeeResult<()> {
        if records.len() > self.max_records {
            return Err(RelayFeeError::TooManyFeeRecords {
                packet_id: packet_id.clone(),
                max: self.max_records,
            });
        }
        sum_by_denom(records)?;

        if queued {
            return Self::write_records(overlay, queued_fees_key(packet_id), records);
        }
        Self::write_records(overlay, packet_fees_key(packet_id), records)?;
        if !records.is_empty() {
            Self::set_status(overlay, packet_id, PacketFeeStatus::FeesEscrowed)?;
            self.index.add(overlay, packet_id);
        }
        Ok(())
    }

    /// Settle the active records of a resolved packet
    pub async fn release_for_distribution<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
        outcome: &PacketOutcome,
    ) -> RelayFeeResult<SettlementReport> {
        let records = self.packet_fees(overlay, packet_id).await?;
        if records.is_empty() {
            return Err(RelayFeeError::NoFeesInEscrow(packet_id.clone()));
        }
        self.ensure_escrow_covers(overlay, &records).await?;

        let report = self
            .settle(overlay, &records, |record| plan_payouts(record, outcome))
            .await?;

        Self::write_records(overlay, packet_fees_key(packet_id), &report.retained)?;
        if report.is_complete() {
            Self::set_status(overlay, packet_id, PacketFeeStatus::Distributed)?;
            self.index.remove(overlay, packet_id);
        } else {
            warn!(
                "{} fee records for {} could not be paid out and stay escrowed",
                report.retained.len(),
                packet_id
            );
        }
        Ok(report)
    }

    /// Return every escrowed amount of a packet, active and queued, to its
    /// payer. A packet with nothing escrowed yields an empty report.
    pub async fn force_refund<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<SettlementReport> {
        let active = self.packet_fees(overlay, packet_id).await?;
        let queued = self.queued_fees(overlay, packet_id).await?;
        if active.is_empty() && queued.is_empty() {
            return Ok(SettlementReport::default());
        }

        let mut all = active.clone();
        all.extend(queued.iter().cloned());
        self.ensure_escrow_covers(overlay, &all).await?;

        let active_report = self.settle(overlay, &active, plan_refund).await?;
        let queued_report = self.settle(overlay, &queued, plan_refund).await?;

        Self::write_records(overlay, packet_fees_key(packet_id), &active_report.retained)?;
        Self::write_records(overlay, queued_fees_key(packet_id), &queued_report.retained)?;
        if active_report.retained.is_empty() {
            self.index.remove(overlay, packet_id);
        }

        let report = SettlementReport {
            payouts: [active_report.payouts, queued_report.payouts].concat(),
            retained: [active_report.retained, queued_report.retained].concat(),
        };
        if report.is_complete() {
            Self::set_status(overlay, packet_id, PacketFeeStatus::Refunded)?;
            info!("Refunded all fees for {}", packet_id);
        } else {
            warn!(
                "{} fee records for {} could not be refunded and stay escrowed",
                report.retained.len(),
                packet_id
            );
        }
        Ok(report)
    }

    /// Apply the planned payouts of each record. A record whose transfers
    /// fail is rolled back on its own and kept.
    async fn settle<S, F>(
        &self,
        overlay: &mut StateOverlay<S>,
        records: &[PacketFee],
        plan: F,
    ) -> RelayFeeResult<SettlementReport>
    where
        S: StateStore + ?Sized,
        F: Fn(&PacketFee) -> Vec<Payout>,
    {
        let mut report = SettlementReport::default();

        'records: for record in records {
            let checkpoint = overlay.checkpoint();
            let payouts = plan(record);

            for payout in &payouts {
                if let Err(e) = self
                    .bank
                    .send(overlay, &self.escrow_account, &payout.recipient, &payout.coin)
                    .await
                {
                    warn!(
                        "Payout of {} to {} failed: {}",
                        payout.coin, payout.recipient, e
                    );
                    overlay.revert(checkpoint);
                    report.retained.push(record.clone());
                    continue 'records;
                }
            }

            report.payouts.extend(payouts);
        }

        Ok(report)
    }

    /// The escrow account must hold at least the sum of `records`
    async fn ensure_escrow_covers<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        records: &[PacketFee],
    ) -> RelayFeeResult<()> {
        for (denom, required) in sum_by_denom(records)? {
            let available = self.bank.balance(overlay, &self.escrow_account, &denom).await?;
            if available < required {
                warn!(
                    "Escrow holds {} {} but packet needs {}",
                    available, denom, required
                );
                return Err(RelayFeeError::FeeModuleLocked);
            }
        }
        Ok(())
    }

    /// Sum of every active and queued record, per denomination
    pub async fn outstanding<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
    ) -> RelayFeeResult<BTreeMap<Denom, Amount>> {
        let mut totals: BTreeMap<Denom, Amount> = BTreeMap::new();
        for prefix in [PACKET_FEES_PREFIX, QUEUED_FEES_PREFIX] {
            for (_, records) in self.scan_records(overlay, prefix).await? {
                for (denom, amount) in sum_by_denom(&records)? {
                    let entry = totals.entry(denom).or_insert(Amount::ZERO);
                    *entry = entry
                        .checked_add(amount)
                        .ok_or_else(|| RelayFeeError::Internal("outstanding fee overflow".into()))?;
                }
            }
        }
        Ok(totals)
    }

    /// Every stored record list under `prefix`, keyed by packet
    pub async fn scan_records<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        prefix: &str,
    ) -> RelayFeeResult<Vec<(PacketId, Vec<PacketFee>)>> {
        let mut out = Vec::new();
        for (key, value) in overlay.scan_prefix(prefix.as_bytes()).await? {
            let packet_id = parse_packet_key(prefix, &key).ok_or_else(|| {
                RelayFeeError::StateCorruption(format!(
                    "malformed fee record key {}",
                    String::from_utf8_lossy(&key)
                ))
            })?;
            out.push((packet_id, relayfee_state::decode_value(&value)?));
        }
        Ok(out)
    }
}

fn sum_by_denom(records: &[PacketFee]) -> RelayFeeResult<BTreeMap<Denom, Amount>> {
    let mut totals: BTreeMap<Denom, Amount> = BTreeMap::new();
    for record in records {
        let entry = totals.entry(record.fee.denom.clone()).or_insert(Amount::ZERO);
        *entry = entry
            .checked_add(record.fee.total()?)
            .ok_or_else(|| RelayFeeError::Internal("fee total overflow".into()))?;
    }
    Ok(totals)
}
