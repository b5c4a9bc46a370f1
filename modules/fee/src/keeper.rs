//! Fee keeper
//!
//! Entry point for every fee transaction, packet callback and query. State
//! mutations are serialized behind one execution lock; each runs in its own
//! overlay that commits as a single batch, so a failure leaves no trace.
//! Events are emitted only after a successful commit.

use relayfee_core::{
    Address, Amount, ChannelId, ChannelKeeper, Coin, Denom, FeeConfig, PacketId, PortId,
    RelayFeeError, RelayFeeResult, Sequence,
};
use relayfee_state::{StateOverlay, StateStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bank::Bank;
use crate::distribution::FeeDistributor;
use crate::escrow::FeeEscrowLedger;
use crate::events::{EventLog, FeeEvent};
use crate::index::IncentivizedPacketIndex;
use crate::keys::{
    fee_enabled_key, parse_fee_enabled_key, parse_packet_key, queued_channel_prefix,
    FEE_ENABLED_PREFIX, FEE_LOCKED_KEY, QUEUED_FEES_PREFIX,
};
use crate::msgs::{
    FeeReceipt, MsgPayPacketFee, MsgPayPacketFeeAsync, MsgRegisterCounterpartyPayee,
    MsgRegisterPayee,
};
use crate::payee::PayeeRegistry;
use crate::types::{
    EscrowAudit, Fee, FeeEnabledChannel, IncentivizedPacket, PacketFee, PacketFeeStatus,
    PayoutKind, SettlementReport,
};
use crate::validator::FeeMsgValidator;

pub struct FeeKeeper<S: StateStore + ?Sized, C: ChannelKeeper + ?Sized> {
    pub(crate) store: Arc<S>,
    channels: Arc<C>,
    config: FeeConfig,
    validator: FeeMsgValidator,
    pub(crate) ledger: FeeEscrowLedger,
    pub(crate) payees: PayeeRegistry,
    index: IncentivizedPacketIndex,
    distributor: FeeDistributor,
    events: EventLog,
    pub(crate) exec_lock: Mutex<()>,
}

impl<S: StateStore + ?Sized, C: ChannelKeeper + ?Sized> FeeKeeper<S, C> {
    pub fn new(store: Arc<S>, channels: Arc<C>, config: FeeConfig) -> RelayFeeResult<Self> {
        config.validate()?;

        let escrow_account = Address::new(config.escrow_account.clone())
            .map_err(|e| RelayFeeError::ConfigError(format!("escrow_account: {e}")))?;
        let blocked = config
            .blocked_addresses
            .iter()
            .map(|a| {
                Address::new(a.clone())
                    .map_err(|e| RelayFeeError::ConfigError(format!("blocked_addresses: {e}")))
            })
            .collect::<RelayFeeResult<Vec<_>>>()?;

        let payees = PayeeRegistry;
        Ok(Self {
            store,
            channels,
            validator: FeeMsgValidator::new(&config)?,
            ledger: FeeEscrowLedger::new(
                escrow_account,
                config.max_records_per_packet,
                Bank::new(blocked),
            ),
            payees,
            index: IncentivizedPacketIndex,
            distributor: FeeDistributor::new(payees),
            events: EventLog::new(),
            exec_lock: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &FeeConfig {
        &self.config
    }

    pub fn fee_denom(&self) -> &Denom {
        self.validator.fee_denom()
    }

    pub fn escrow_account(&self) -> &Address {
        self.ledger.escrow_account()
    }

    pub fn channels(&self) -> &Arc<C> {
        &self.channels
    }

    /// Events emitted since the last call
    pub fn drain_events(&self) -> Vec<FeeEvent> {
        self.events.drain()
    }

    pub(crate) fn overlay(&self) -> StateOverlay<S> {
        StateOverlay::new(self.store.clone())
    }

    // ============ Guards ============

    async fn ensure_unlocked(&self, overlay: &StateOverlay<S>) -> RelayFeeResult<()> {
        if overlay.exists(FEE_LOCKED_KEY).await? {
            return Err(RelayFeeError::FeeModuleLocked);
        }
        Ok(())
    }

    async fn ensure_fee_enabled(
        &self,
        overlay: &StateOverlay<S>,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<()> {
        if !overlay.exists(&fee_enabled_key(port_id, channel_id)).await? {
            return Err(RelayFeeError::ChannelNotFeeEnabled {
                port_id: port_id.clone(),
                channel_id: channel_id.clone(),
            });
        }
        Ok(())
    }

    async fn ensure_channel_open(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.channels
            .channel(port_id, channel_id)
            .await
            .ok_or_else(|| RelayFeeError::ChannelNotFound {
                port_id: port_id.clone(),
                channel_id: channel_id.clone(),
            })?
            .ensure_open(port_id, channel_id)
    }

    /// The packet was sent and is neither acknowledged nor timed out
    async fn ensure_in_flight(&self, overlay: &StateOverlay<S>, packet_id: &PacketId) -> RelayFeeResult<()> {
        let next = self
            .channels
            .next_sequence_send(&packet_id.port_id, &packet_id.channel_id)
            .await?;
        if packet_id.sequence >= next {
            return Err(RelayFeeError::PacketNotFound(packet_id.clone()));
        }

        let resolved = matches!(
            self.ledger.status(overlay, packet_id).await?,
            Some(status) if status.is_terminal()
        );
        if resolved || !self.channels.has_packet_commitment(packet_id).await {
            return Err(RelayFeeError::PacketAlreadyResolved(packet_id.clone()));
        }
        Ok(())
    }

    /// Common preconditions of the two pay messages
    async fn ensure_payable(&self, overlay: &StateOverlay<S>, packet_id: &PacketId) -> RelayFeeResult<()> {
        self.ensure_unlocked(overlay).await?;
        self.ensure_fee_enabled(overlay, &packet_id.port_id, &packet_id.channel_id)
            .await?;
        self.ensure_channel_open(&packet_id.port_id, &packet_id.channel_id)
            .await
    }

    // ============ Transactions ============

    /// Escrow a fee for a packet that is in flight
    pub async fn pay_packet_fee(&self, msg: MsgPayPacketFee) -> RelayFeeResult<FeeReceipt> {
        self.validator.validate_pay_packet_fee(&msg)?;
        let (packet_id, packet_fee) = msg.into_packet_fee();

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_payable(&overlay, &packet_id).await?;
        self.ensure_in_flight(&overlay, &packet_id).await?;

        let packet_fee = self.ledger.escrow_fee(&mut overlay, &packet_id, packet_fee).await?;
        let event = self.incentivized_event(&overlay, &packet_id).await?;
        overlay.commit().await?;
        self.events.emit_all(event);

        Ok(FeeReceipt {
            packet_id,
            packet_fee,
            queued: false,
        })
    }

    /// Escrow a fee for a packet that may not be sent yet. Funds leave the
    /// payer immediately either way.
    pub async fn pay_packet_fee_async(&self, msg: MsgPayPacketFeeAsync) -> RelayFeeResult<FeeReceipt> {
        self.validator.validate_pay_packet_fee_async(&msg)?;
        let MsgPayPacketFeeAsync {
            packet_id,
            packet_fee,
        } = msg;

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_payable(&overlay, &packet_id).await?;

        let next = self
            .channels
            .next_sequence_send(&packet_id.port_id, &packet_id.channel_id)
            .await?;
        let queued = packet_id.sequence >= next;

        let (packet_fee, events) = if queued {
            let packet_fee = self.ledger.queue_fee(&mut overlay, &packet_id, packet_fee).await?;
            let event = FeeEvent::FeeQueued {
                packet_id: packet_id.clone(),
                fee: packet_fee.fee.clone(),
                payer: packet_fee.refund_address.clone(),
            };
            (packet_fee, vec![event])
        } else {
            self.ensure_in_flight(&overlay, &packet_id).await?;
            let packet_fee = self.ledger.escrow_fee(&mut overlay, &packet_id, packet_fee).await?;
            let events = self.incentivized_event(&overlay, &packet_id).await?;
            (packet_fee, events.into_iter().collect())
        };

        overlay.commit().await?;
        self.events.emit_all(events);

        Ok(FeeReceipt {
            packet_id,
            packet_fee,
            queued,
        })
    }

    pub async fn register_payee(&self, msg: MsgRegisterPayee) -> RelayFeeResult<()> {
        self.validator.validate_register_payee(&msg)?;

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_fee_enabled(&overlay, &msg.port_id, &msg.channel_id)
            .await?;
        self.payees
            .register_payee(&mut overlay, &msg.channel_id, &msg.relayer, &msg.payee)?;
        overlay.commit().await?;

        info!(
            "Registered payee {} for relayer {} on {}",
            msg.payee, msg.relayer, msg.channel_id
        );
        self.events.emit(FeeEvent::RegisterPayee {
            channel_id: msg.channel_id,
            relayer: msg.relayer,
            payee: msg.payee,
        });
        Ok(())
    }

    pub async fn register_counterparty_payee(&self, msg: MsgRegisterCounterpartyPayee) -> RelayFeeResult<()> {
        self.validator.validate_register_counterparty_payee(&msg)?;

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_fee_enabled(&overlay, &msg.port_id, &msg.channel_id)
            .await?;
        self.payees.register_counterparty_payee(
            &mut overlay,
            &msg.channel_id,
            &msg.relayer,
            &msg.counterparty_payee,
        )?;
        overlay.commit().await?;

        info!(
            "Registered counterparty payee {} for relayer {} on {}",
            msg.counterparty_payee, msg.relayer, msg.channel_id
        );
        self.events.emit(FeeEvent::RegisterCounterpartyPayee {
            channel_id: msg.channel_id,
            relayer: msg.relayer,
            counterparty_payee: msg.counterparty_payee,
        });
        Ok(())
    }

    // ============ Channel and packet hooks ============

    pub async fn set_fee_enabled(&self, port_id: &PortId, channel_id: &ChannelId, enabled: bool) -> RelayFeeResult<()> {
        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        let key = fee_enabled_key(port_id, channel_id);
        if enabled {
            overlay.set(key, vec![1]);
        } else {
            overlay.delete(key);
        }
        overlay.commit().await?;

        debug!("Fee support on {}/{}: {}", port_id, channel_id, enabled);
        self.events.emit(FeeEvent::ChannelFeeEnabled {
            port_id: port_id.clone(),
            channel_id: channel_id.clone(),
            enabled,
        });
        Ok(())
    }

    /// Activate fees paid ahead of time for a packet that was just sent
    pub async fn on_packet_sent(&self, packet_id: &PacketId) -> RelayFeeResult<usize> {
        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();

        let activated = self.ledger.activate_queued(&mut overlay, packet_id).await?;
        if activated.is_empty() {
            return Ok(0);
        }
        let event = self.incentivized_event(&overlay, packet_id).await?;
        overlay.commit().await?;
        self.events.emit_all(event);

        info!("Activated {} prepaid fee records for {}", activated.len(), packet_id);
        Ok(activated.len())
    }

    /// Pay out a packet's fees after its acknowledgement was processed
    pub async fn distribute_on_acknowledgement(
        &self,
        packet_id: &PacketId,
        forward_relayer: Option<Address>,
        reverse_relayer: &Address,
    ) -> RelayFeeResult<SettlementReport> {
        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_unlocked(&overlay).await?;

        let result = self
            .distributor
            .distribute_on_acknowledgement(
                &self.ledger,
                &mut overlay,
                packet_id,
                forward_relayer,
                reverse_relayer,
            )
            .await;
        self.commit_settlement(overlay, packet_id, result).await
    }

    /// Pay out a packet's fees after its timeout was processed
    pub async fn distribute_on_timeout(&self, packet_id: &PacketId, relayer: &Address) -> RelayFeeResult<SettlementReport> {
        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_unlocked(&overlay).await?;

        let result = self
            .distributor
            .distribute_on_timeout(&self.ledger, &mut overlay, packet_id, relayer)
            .await;
        self.commit_settlement(overlay, packet_id, result).await
    }

    /// Return every escrowed fee of one packet to its payers
    pub async fn force_refund(&self, packet_id: &PacketId) -> RelayFeeResult<SettlementReport> {
        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ensure_unlocked(&overlay).await?;

        let result = self.ledger.force_refund(&mut overlay, packet_id).await;
        self.commit_settlement(overlay, packet_id, result).await
    }

    /// Refund every packet on a closing channel, including prepaid ones
    pub async fn refund_fees_on_channel_closure(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<SettlementReport> {
        let _guard = self.exec_lock.lock().await;
        let overlay = self.overlay();
        self.ensure_unlocked(&overlay).await?;

        let mut packets: BTreeSet<PacketId> = self
            .index
            .list_by_channel(&overlay, port_id, channel_id)
            .await?
            .into_iter()
            .collect();
        packets.extend(self.queued_packets(&overlay, port_id, channel_id).await?);
        drop(overlay);

        info!(
            "Refunding fees of {} packets on closing channel {}/{}",
            packets.len(),
            port_id,
            channel_id
        );
        self.refund_packets(packets).await
    }

    /// Refund records left escrowed after a failed distribution. Only packets
    /// that are no longer in flight are touched. Queued records count as
    /// stale once their sequence has been used and the packet is gone.
    pub async fn refund_stale_fees(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<SettlementReport> {
        let _guard = self.exec_lock.lock().await;
        let overlay = self.overlay();
        self.ensure_unlocked(&overlay).await?;

        let mut stale = BTreeSet::new();
        for packet_id in self.index.list_by_channel(&overlay, port_id, channel_id).await? {
            if !self.channels.has_packet_commitment(&packet_id).await {
                stale.insert(packet_id);
            }
        }

        // Unknown channel: nothing queued on it was ever sent
        let next_send = self
            .channels
            .next_sequence_send(port_id, channel_id)
            .await
            .unwrap_or(Sequence(1));
        for packet_id in self.queued_packets(&overlay, port_id, channel_id).await? {
            if packet_id.sequence < next_send && !self.channels.has_packet_commitment(&packet_id).await {
                stale.insert(packet_id);
            }
        }
        drop(overlay);

        if !stale.is_empty() {
            info!("Refunding {} stale fee entries on {}/{}", stale.len(), port_id, channel_id);
        }
        self.refund_packets(stale).await
    }

    /// Refund each packet in its own overlay; one failure does not stop the rest.
    /// Caller holds the execution lock.
    async fn refund_packets(&self, packets: BTreeSet<PacketId>) -> RelayFeeResult<SettlementReport> {
        let mut total = SettlementReport::default();

        for packet_id in packets {
            let mut overlay = self.overlay();
            let result = self.ledger.force_refund(&mut overlay, &packet_id).await;
            match self.commit_settlement(overlay, &packet_id, result).await {
                Ok(report) => {
                    total.payouts.extend(report.payouts);
                    total.retained.extend(report.retained);
                }
                Err(RelayFeeError::FeeModuleLocked) => return Err(RelayFeeError::FeeModuleLocked),
                Err(e) => {
                    error!("Refund of {} failed: {}", packet_id, e);
                    self.events.emit(FeeEvent::DistributionFailed {
                        packet_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(total)
    }

    /// Commit a settlement and publish its events, or lock the module when the
    /// escrow turned out to be short. Caller holds the execution lock.
    async fn commit_settlement(
        &self,
        overlay: StateOverlay<S>,
        packet_id: &PacketId,
        result: RelayFeeResult<SettlementReport>,
    ) -> RelayFeeResult<SettlementReport> {
        match result {
            Ok(report) => {
                overlay.commit().await?;
                self.emit_settlement(packet_id, &report);
                Ok(report)
            }
            Err(RelayFeeError::FeeModuleLocked) => {
                drop(overlay);
                self.lock_module().await?;
                Err(RelayFeeError::FeeModuleLocked)
            }
            Err(e) => Err(e),
        }
    }

    fn emit_settlement(&self, packet_id: &PacketId, report: &SettlementReport) {
        let payouts = report.payouts.iter().map(|payout| match payout.kind {
            PayoutKind::Refund => FeeEvent::RefundFee {
                packet_id: packet_id.clone(),
                receiver: payout.recipient.clone(),
                fee: payout.coin.clone(),
            },
            kind => FeeEvent::DistributeFee {
                packet_id: packet_id.clone(),
                receiver: payout.recipient.clone(),
                fee: payout.coin.clone(),
                kind,
            },
        });
        self.events.emit_all(payouts);

        if !report.is_complete() {
            self.events.emit(FeeEvent::DistributionFailed {
                packet_id: packet_id.clone(),
                reason: format!("{} fee records retained in escrow", report.retained.len()),
            });
        }
    }

    // ============ Bank ============

    /// Plain account transfer for host applications. The fee escrow account
    /// is only reachable through fee messages.
    pub async fn send_coins(&self, from: &Address, to: &Address, coin: &Coin) -> RelayFeeResult<()> {
        let escrow = self.escrow_account();
        if from == escrow || to == escrow {
            return Err(RelayFeeError::TransferBlocked(escrow.to_string()));
        }

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ledger.bank().send(&mut overlay, from, to, coin).await?;
        overlay.commit().await?;
        Ok(())
    }

    /// Credit new coins to an account. Devnet faucet and tests only.
    pub async fn mint(&self, to: &Address, coin: &Coin) -> RelayFeeResult<()> {
        if to == self.escrow_account() {
            return Err(RelayFeeError::TransferBlocked(to.to_string()));
        }

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        self.ledger.bank().mint(&mut overlay, to, coin).await?;
        overlay.commit().await?;
        Ok(())
    }

    // ============ Escrow audit ============

    pub(crate) async fn audit(&self, overlay: &StateOverlay<S>) -> RelayFeeResult<Vec<EscrowAudit>> {
        let outstanding = self.ledger.outstanding(overlay).await?;

        let mut denoms: BTreeSet<Denom> = outstanding.keys().cloned().collect();
        denoms.insert(self.fee_denom().clone());

        let mut audits = Vec::with_capacity(denoms.len());
        for denom in denoms {
            audits.push(EscrowAudit {
                escrow_balance: self
                    .ledger
                    .bank()
                    .balance(overlay, self.escrow_account(), &denom)
                    .await?,
                outstanding: outstanding.get(&denom).copied().unwrap_or(Amount::ZERO),
                denom,
            });
        }
        Ok(audits)
    }

    /// Lock the fee module. Caller holds the execution lock.
    async fn lock_module(&self) -> RelayFeeResult<()> {
        let mut overlay = self.overlay();
        let audits = self.audit(&overlay).await?;
        overlay.set(FEE_LOCKED_KEY.to_vec(), vec![1]);
        overlay.commit().await?;

        for audit in audits.into_iter().filter(|a| !a.is_covered()) {
            error!(
                "Fee escrow short: holds {} {} against {} outstanding",
                audit.escrow_balance, audit.denom, audit.outstanding
            );
            self.events.emit(FeeEvent::FeeModuleLocked {
                denom: audit.denom,
                escrow_balance: audit.escrow_balance,
                outstanding: audit.outstanding,
            });
        }
        error!("Fee module locked; fee messages are rejected until the escrow is restored");
        Ok(())
    }

    /// Compare the escrow account with the sum of all records and lock the
    /// module on any shortfall
    pub async fn check_conservation(&self) -> RelayFeeResult<Vec<EscrowAudit>> {
        let _guard = self.exec_lock.lock().await;
        let overlay = self.overlay();
        let audits = self.audit(&overlay).await?;

        if audits.iter().all(EscrowAudit::is_covered) {
            for audit in audits.iter().filter(|a| a.escrow_balance != a.outstanding) {
                warn!(
                    "Fee escrow holds {} {} above outstanding {}",
                    audit.escrow_balance, audit.denom, audit.outstanding
                );
            }
        } else if !overlay.exists(FEE_LOCKED_KEY).await? {
            self.lock_module().await?;
        }
        Ok(audits)
    }

    pub async fn is_locked(&self) -> RelayFeeResult<bool> {
        self.overlay().exists(FEE_LOCKED_KEY).await
    }

    // ============ Queries ============

    pub async fn is_fee_enabled(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<bool> {
        self.overlay().exists(&fee_enabled_key(port_id, channel_id)).await
    }

    pub async fn fee_enabled_channels(&self) -> RelayFeeResult<Vec<FeeEnabledChannel>> {
        let overlay = self.overlay();
        overlay
            .scan_prefix(FEE_ENABLED_PREFIX.as_bytes())
            .await?
            .into_iter()
            .map(|(key, _)| {
                parse_fee_enabled_key(&key)
                    .map(|(port_id, channel_id)| FeeEnabledChannel {
                        port_id,
                        channel_id,
                    })
                    .ok_or_else(|| {
                        RelayFeeError::StateCorruption(format!(
                            "malformed fee enabled key {}",
                            String::from_utf8_lossy(&key)
                        ))
                    })
            })
            .collect()
    }

    /// Packets with outstanding fees on one channel, in sequence order
    pub async fn incentivized_packets(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<Vec<IncentivizedPacket>> {
        let overlay = self.overlay();
        let ids = self.index.list_by_channel(&overlay, port_id, channel_id).await?;
        self.collect_incentivized(&overlay, ids).await
    }

    pub async fn all_incentivized_packets(&self) -> RelayFeeResult<Vec<IncentivizedPacket>> {
        let overlay = self.overlay();
        let ids = self.index.list_all(&overlay).await?;
        self.collect_incentivized(&overlay, ids).await
    }

    async fn collect_incentivized(
        &self,
        overlay: &StateOverlay<S>,
        ids: Vec<PacketId>,
    ) -> RelayFeeResult<Vec<IncentivizedPacket>> {
        let mut packets = Vec::with_capacity(ids.len());
        for packet_id in ids {
            let records = self.ledger.packet_fees(overlay, &packet_id).await?;
            if let Some(packet) = IncentivizedPacket::from_records(packet_id, records)? {
                packets.push(packet);
            }
        }
        Ok(packets)
    }

    pub async fn incentivized_packet(&self, packet_id: &PacketId) -> RelayFeeResult<IncentivizedPacket> {
        let overlay = self.overlay();
        let records = self.ledger.packet_fees(&overlay, packet_id).await?;
        IncentivizedPacket::from_records(packet_id.clone(), records)?
            .ok_or_else(|| RelayFeeError::PacketNotFound(packet_id.clone()))
    }

    /// Sum of the active records of a packet
    pub async fn total_fees(&self, packet_id: &PacketId) -> RelayFeeResult<Fee> {
        Ok(self.incentivized_packet(packet_id).await?.total_fee)
    }

    pub async fn queued_fees(&self, packet_id: &PacketId) -> RelayFeeResult<Vec<PacketFee>> {
        self.ledger.queued_fees(&self.overlay(), packet_id).await
    }

    pub async fn packet_status(&self, packet_id: &PacketId) -> RelayFeeResult<Option<PacketFeeStatus>> {
        self.ledger.status(&self.overlay(), packet_id).await
    }

    /// Registered same-chain payee, if any
    pub async fn payee(&self, channel_id: &ChannelId, relayer: &Address) -> RelayFeeResult<Option<Address>> {
        self.payees.payee(&self.overlay(), channel_id, relayer).await
    }

    /// Registered counterparty payee, if any
    pub async fn counterparty_payee(
        &self,
        channel_id: &ChannelId,
        relayer: &Address,
    ) -> RelayFeeResult<Option<Address>> {
        self.payees
            .counterparty_payee(&self.overlay(), channel_id, relayer)
            .await
    }

    /// Address the forward relayer of a packet received on `channel_id` is paid at
    pub async fn resolve_counterparty_payee(&self, channel_id: &ChannelId, relayer: &Address) -> Address {
        self.payees
            .resolve_counterparty_payee(&self.overlay(), channel_id, relayer)
            .await
    }

    pub async fn balance(&self, address: &Address, denom: &Denom) -> RelayFeeResult<Amount> {
        self.ledger.bank().balance(&self.overlay(), address, denom).await
    }

    pub async fn balances(&self, address: &Address) -> RelayFeeResult<Vec<Coin>> {
        Ok(self
            .ledger
            .bank()
            .all_balances(&self.overlay())
            .await?
            .into_iter()
            .filter(|(owner, _)| owner == address)
            .map(|(_, coin)| coin)
            .collect())
    }

    // ============ Helpers ============

    async fn queued_packets(
        &self,
        overlay: &StateOverlay<S>,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> RelayFeeResult<Vec<PacketId>> {
        overlay
            .scan_prefix(&queued_channel_prefix(port_id, channel_id))
            .await?
            .into_iter()
            .map(|(key, _)| {
                parse_packet_key(QUEUED_FEES_PREFIX, &key).ok_or_else(|| {
                    RelayFeeError::StateCorruption(format!(
                        "malformed queued fee key {}",
                        String::from_utf8_lossy(&key)
                    ))
                })
            })
            .collect()
    }

    async fn incentivized_event(
        &self,
        overlay: &StateOverlay<S>,
        packet_id: &PacketId,
    ) -> RelayFeeResult<Option<FeeEvent>> {
        let records = self.ledger.packet_fees(overlay, packet_id).await?;
        Ok(IncentivizedPacket::from_records(packet_id.clone(), records)?.map(|packet| {
            FeeEvent::IncentivizedPacket {
                packet_id: packet.packet_id,
                total_fee: packet.total_fee,
                records: packet.packet_fees.len(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannelKeeper;
    use relayfee_core::{ChannelState, Counterparty, Order, Sequence, Timestamp, Version};
    use relayfee_state::MemoryStateStore;

    type TestKeeper = FeeKeeper<MemoryStateStore, InMemoryChannelKeeper>;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn stake() -> Denom {
        Denom::new("stake").unwrap()
    }

    fn fee(recv: u128, ack: u128, timeout: u128) -> Fee {
        Fee::new(stake(), Amount(recv), Amount(ack), Amount(timeout))
    }

    struct Harness {
        keeper: Arc<TestKeeper>,
        channels: Arc<InMemoryChannelKeeper>,
        channel_id: ChannelId,
    }

    impl Harness {
        async fn new(config: FeeConfig) -> Self {
            let store = Arc::new(MemoryStateStore::new());
            let channels = Arc::new(InMemoryChannelKeeper::new());
            let keeper = Arc::new(FeeKeeper::new(store, channels.clone(), config).unwrap());

            let channel_id = channels.create_channel(
                &PortId::transfer(),
                ChannelState::Open,
                Order::Unordered,
                Counterparty {
                    port_id: PortId::transfer(),
                    channel_id: Some(ChannelId::new(0)),
                },
                Version::ics20(),
            );
            keeper
                .set_fee_enabled(&PortId::transfer(), &channel_id, true)
                .await
                .unwrap();

            let mut overlay = keeper.overlay();
            for payer in ["payer1", "payer2"] {
                keeper
                    .ledger
                    .bank()
                    .mint(&mut overlay, &addr(payer), &Coin::new(stake(), Amount(1_000)))
                    .await
                    .unwrap();
            }
            overlay.commit().await.unwrap();

            Self {
                keeper,
                channels,
                channel_id,
            }
        }

        fn send(&self) -> PacketId {
            self.channels
                .send_packet(&PortId::transfer(), &self.channel_id, vec![], Timestamp(0))
                .unwrap()
                .source_id()
        }

        fn packet(&self, sequence: u64) -> PacketId {
            PacketId::new(PortId::transfer(), self.channel_id.clone(), Sequence(sequence))
        }

        async fn pay(&self, packet_id: &PacketId, payer: &str, fee: Fee) -> RelayFeeResult<FeeReceipt> {
            self.keeper
                .pay_packet_fee(MsgPayPacketFee {
                    packet_id: packet_id.clone(),
                    fee,
                    signer: addr(payer),
                    relayers: vec![],
                })
                .await
        }

        async fn incentivized(&self) -> Vec<IncentivizedPacket> {
            self.keeper
                .incentivized_packets(&PortId::transfer(), &self.channel_id)
                .await
                .unwrap()
        }

        async fn balance(&self, who: &str) -> u128 {
            self.keeper.balance(&addr(who), &stake()).await.unwrap().0
        }

        async fn assert_conserved(&self) {
            for audit in self.keeper.check_conservation().await.unwrap() {
                assert_eq!(audit.escrow_balance, audit.outstanding);
            }
        }
    }

    #[tokio::test]
    async fn test_pay_and_query() {
        let h = Harness::new(FeeConfig::default()).await;
        let packet_id = h.send();

        h.pay(&packet_id, "payer1", fee(50, 25, 10)).await.unwrap();

        let packets = h
            .keeper
            .incentivized_packets(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].total_fee, fee(50, 25, 10));
        assert_eq!(h.balance("payer1").await, 915);
        assert!(h
            .keeper
            .drain_events()
            .iter()
            .any(|e| matches!(e, FeeEvent::IncentivizedPacket { .. })));
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_pay_rejections() {
        let h = Harness::new(FeeConfig::default()).await;

        // not sent yet
        let err = h.pay(&h.packet(1), "payer1", fee(1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, RelayFeeError::PacketNotFound(_)));

        // sent and acknowledged
        let packet_id = h.send();
        h.channels.delete_commitment(&packet_id);
        let err = h.pay(&packet_id, "payer1", fee(1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, RelayFeeError::PacketAlreadyResolved(_)));

        // channel without fee support
        h.keeper
            .set_fee_enabled(&PortId::transfer(), &h.channel_id, false)
            .await
            .unwrap();
        let packet_id = h.send();
        let err = h.pay(&packet_id, "payer1", fee(1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, RelayFeeError::ChannelNotFeeEnabled { .. }));

        assert_eq!(h.balance("payer1").await, 1_000);
    }

    #[tokio::test]
    async fn test_index_follows_lifecycle() {
        let h = Harness::new(FeeConfig::default()).await;
        let packet_id = h.send();

        assert!(h.incentivized().await.is_empty());
        h.pay(&packet_id, "payer1", fee(50, 25, 10)).await.unwrap();
        assert_eq!(h.incentivized().await.len(), 1);

        h.keeper
            .distribute_on_acknowledgement(&packet_id, Some(addr("forward")), &addr("reverse"))
            .await
            .unwrap();
        assert!(h.incentivized().await.is_empty());
        assert_eq!(
            h.keeper.packet_status(&packet_id).await.unwrap(),
            Some(PacketFeeStatus::Distributed)
        );
        assert_eq!(h.balance("forward").await, 50);
        assert_eq!(h.balance("reverse").await, 25);
        assert_eq!(h.balance("payer1").await, 925);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_registered_payee_receives_ack_fee() {
        let h = Harness::new(FeeConfig::default()).await;
        let packet_id = h.send();

        h.keeper
            .register_payee(MsgRegisterPayee {
                port_id: PortId::transfer(),
                channel_id: h.channel_id.clone(),
                relayer: addr("reverse"),
                payee: addr("reversepayee"),
            })
            .await
            .unwrap();
        h.pay(&packet_id, "payer1", fee(50, 25, 10)).await.unwrap();
        h.keeper
            .distribute_on_timeout(&packet_id, &addr("reverse"))
            .await
            .unwrap();

        assert_eq!(h.balance("reversepayee").await, 10);
        assert_eq!(h.balance("reverse").await, 0);
        assert_eq!(h.balance("payer1").await, 990);
    }

    #[tokio::test]
    async fn test_async_fee_queues_until_sent() {
        let h = Harness::new(FeeConfig::default()).await;
        let future = h.packet(1);

        let receipt = h
            .keeper
            .pay_packet_fee_async(MsgPayPacketFeeAsync {
                packet_id: future.clone(),
                packet_fee: PacketFee::new(fee(10, 10, 10), addr("payer1"), vec![]),
            })
            .await
            .unwrap();
        assert!(receipt.queued);
        assert_eq!(h.balance("payer1").await, 970);
        assert!(h.keeper.incentivized_packet(&future).await.is_err());
        h.assert_conserved().await;

        let sent = h.send();
        assert_eq!(sent, future);
        assert_eq!(h.keeper.on_packet_sent(&sent).await.unwrap(), 1);
        assert_eq!(h.keeper.total_fees(&sent).await.unwrap(), fee(10, 10, 10));
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_channel_closure_refunds_active_and_queued() {
        let h = Harness::new(FeeConfig::default()).await;
        let first = h.send();
        h.pay(&first, "payer1", fee(50, 25, 10)).await.unwrap();
        h.pay(&first, "payer2", fee(5, 5, 5)).await.unwrap();
        h.keeper
            .pay_packet_fee_async(MsgPayPacketFeeAsync {
                packet_id: h.packet(2),
                packet_fee: PacketFee::new(fee(1, 1, 1), addr("payer2"), vec![]),
            })
            .await
            .unwrap();

        let report = h
            .keeper
            .refund_fees_on_channel_closure(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(h.balance("payer1").await, 1_000);
        assert_eq!(h.balance("payer2").await, 1_000);
        assert_eq!(h.balance("feeibc").await, 0);
        assert_eq!(
            h.keeper.packet_status(&first).await.unwrap(),
            Some(PacketFeeStatus::Refunded)
        );
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_blocked_payee_leaves_stale_fee() {
        let config = FeeConfig {
            blocked_addresses: vec!["blocked".into()],
            ..Default::default()
        };
        let h = Harness::new(config).await;
        let packet_id = h.send();
        h.pay(&packet_id, "payer1", fee(50, 25, 10)).await.unwrap();

        let report = h
            .keeper
            .distribute_on_acknowledgement(&packet_id, Some(addr("blocked")), &addr("reverse"))
            .await
            .unwrap();
        assert_eq!(report.retained.len(), 1);
        assert_eq!(h.keeper.total_fees(&packet_id).await.unwrap(), fee(50, 25, 10));
        h.assert_conserved().await;

        // still in flight: the sweep leaves it alone
        let swept = h
            .keeper
            .refund_stale_fees(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();
        assert!(swept.payouts.is_empty());

        h.channels.delete_commitment(&packet_id);
        let swept = h
            .keeper
            .refund_stale_fees(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();
        assert_eq!(swept.payouts.len(), 1);
        assert_eq!(h.balance("payer1").await, 1_000);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_payer_must_be_refundable() {
        let config = FeeConfig {
            blocked_addresses: vec!["blocked".into()],
            ..Default::default()
        };
        let h = Harness::new(config).await;
        let packet_id = h.send();
        h.pay(&packet_id, "payer1", fee(50, 25, 10)).await.unwrap();

        let mut overlay = h.keeper.overlay();
        h.keeper
            .ledger
            .bank()
            .mint(&mut overlay, &addr("blocked"), &Coin::new(stake(), Amount(1_000)))
            .await
            .unwrap();
        overlay.commit().await.unwrap();

        for payer in ["feeibc", "blocked"] {
            assert!(matches!(
                h.pay(&packet_id, payer, fee(50, 25, 10)).await,
                Err(RelayFeeError::TransferBlocked(_))
            ));
            let queued = h
                .keeper
                .pay_packet_fee_async(MsgPayPacketFeeAsync {
                    packet_id: h.packet(2),
                    packet_fee: PacketFee::new(fee(50, 25, 10), addr(payer), vec![]),
                })
                .await;
            assert!(matches!(queued, Err(RelayFeeError::TransferBlocked(_))));
        }

        assert_eq!(h.balance("feeibc").await, 85);
        assert_eq!(h.balance("blocked").await, 1_000);
        assert_eq!(h.keeper.total_fees(&packet_id).await.unwrap(), fee(50, 25, 10));
        h.assert_conserved().await;

        // The real payer's fee still settles normally
        h.keeper
            .distribute_on_timeout(&packet_id, &addr("relayer"))
            .await
            .unwrap();
        assert_eq!(h.balance("relayer").await, 10);
        assert_eq!(h.balance("payer1").await, 990);
        assert_eq!(h.balance("feeibc").await, 0);
    }

    #[tokio::test]
    async fn test_stale_sweep_refunds_queued_fee_of_finished_packet() {
        let h = Harness::new(FeeConfig::default()).await;
        h.keeper
            .pay_packet_fee_async(MsgPayPacketFeeAsync {
                packet_id: h.packet(1),
                packet_fee: PacketFee::new(fee(50, 25, 10), addr("payer1"), vec![]),
            })
            .await
            .unwrap();

        // Not sent yet: the queued record is left for the future packet
        let swept = h
            .keeper
            .refund_stale_fees(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();
        assert!(swept.payouts.is_empty());

        // Sent without the records being activated, then in flight
        let packet_id = h.send();
        let swept = h
            .keeper
            .refund_stale_fees(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();
        assert!(swept.payouts.is_empty());

        // Finished: nothing can ever pay these records out
        h.channels.delete_commitment(&packet_id);
        let swept = h
            .keeper
            .refund_stale_fees(&PortId::transfer(), &h.channel_id)
            .await
            .unwrap();
        assert_eq!(swept.payouts.len(), 1);
        assert_eq!(h.balance("payer1").await, 1_000);
        assert_eq!(h.balance("feeibc").await, 0);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_concurrent_payments_append() {
        let h = Harness::new(FeeConfig::default()).await;
        let packet_id = h.send();

        let mut handles = Vec::new();
        for payer in ["payer1", "payer2"] {
            for _ in 0..5 {
                let keeper = h.keeper.clone();
                let packet_id = packet_id.clone();
                handles.push(tokio::spawn(async move {
                    keeper
                        .pay_packet_fee(MsgPayPacketFee {
                            packet_id,
                            fee: fee(1, 2, 3),
                            signer: addr(payer),
                            relayers: vec![],
                        })
                        .await
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let packet = h.keeper.incentivized_packet(&packet_id).await.unwrap();
        assert_eq!(packet.packet_fees.len(), 10);
        assert_eq!(packet.total_fee, fee(10, 20, 30));
        assert_eq!(h.balance("feeibc").await, 60);
        h.assert_conserved().await;
    }

    #[tokio::test]
    async fn test_shortfall_locks_module() {
        let h = Harness::new(FeeConfig::default()).await;
        let packet_id = h.send();
        h.pay(&packet_id, "payer1", fee(50, 25, 10)).await.unwrap();

        // drain the escrow account outside the fee module
        let mut overlay = h.keeper.overlay();
        h.keeper
            .ledger
            .bank()
            .send(&mut overlay, &addr("feeibc"), &addr("thief"), &Coin::new(stake(), Amount(1)))
            .await
            .unwrap();
        overlay.commit().await.unwrap();

        let audits = h.keeper.check_conservation().await.unwrap();
        assert!(audits.iter().any(|a| !a.is_covered()));
        assert!(h.keeper.is_locked().await.unwrap());

        let second = h.send();
        let err = h.pay(&second, "payer1", fee(1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, RelayFeeError::FeeModuleLocked));
        let err = h
            .keeper
            .distribute_on_timeout(&packet_id, &addr("relayer"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayFeeError::FeeModuleLocked));
    }
}
