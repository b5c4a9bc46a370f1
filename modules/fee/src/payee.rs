//! Relayer payout addresses
//!
//! Two tables, both keyed by `(channel, relayer)`:
//! - payee: where a relayer on this chain (ack or timeout submitter) is paid
//! - counterparty payee: the address on the counterparty chain that a
//!   relayer receiving packets here wants its receive fee sent to
//!
//! Registration is an upsert. Lookups never fail; an absent or unreadable
//! entry resolves to the relayer itself.

use relayfee_core::{Address, ChannelId, RelayFeeError, RelayFeeResult};
use relayfee_state::{StateOverlay, StateStore};
use tracing::{debug, warn};

use crate::keys::{
    counterparty_payee_key, parse_payee_key, payee_key, COUNTERPARTY_PAYEE_PREFIX, PAYEE_PREFIX,
};
use crate::types::RegisteredPayee;

#[derive(Debug, Clone, Copy, Default)]
pub struct PayeeRegistry;

impl PayeeRegistry {
    pub fn register_payee<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        channel_id: &ChannelId,
        relayer: &Address,
        payee: &Address,
    ) -> RelayFeeResult<()> {
        overlay.set_value(payee_key(channel_id, relayer), payee)?;
        debug!("Payee for {} on {} set to {}", relayer, channel_id, payee);
        Ok(())
    }

    pub fn register_counterparty_payee<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        channel_id: &ChannelId,
        relayer: &Address,
        counterparty_payee: &Address,
    ) -> RelayFeeResult<()> {
        overlay.set_value(counterparty_payee_key(channel_id, relayer), counterparty_payee)?;
        debug!(
            "Counterparty payee for {} on {} set to {}",
            relayer, channel_id, counterparty_payee
        );
        Ok(())
    }

    /// Registered same-chain payee, if any
    pub async fn payee<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        channel_id: &ChannelId,
        relayer: &Address,
    ) -> RelayFeeResult<Option<Address>> {
        overlay.get_value(&payee_key(channel_id, relayer)).await
    }

    /// Registered counterparty payee, if any
    pub async fn counterparty_payee<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        channel_id: &ChannelId,
        relayer: &Address,
    ) -> RelayFeeResult<Option<Address>> {
        overlay.get_value(&counterparty_payee_key(channel_id, relayer)).await
    }

    /// Payout address for the forward relayer of a packet received on `channel_id`
    pub async fn resolve_counterparty_payee<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        channel_id: &ChannelId,
        relayer: &Address,
    ) -> Address {
        let lookup = self.counterparty_payee(overlay, channel_id, relayer).await;
        Self::or_relayer(lookup, channel_id, relayer)
    }

    /// Payout address for an ack or timeout relayer on `channel_id`
    pub async fn resolve_payee<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        channel_id: &ChannelId,
        relayer: &Address,
    ) -> Address {
        let lookup = self.payee(overlay, channel_id, relayer).await;
        Self::or_relayer(lookup, channel_id, relayer)
    }

    fn or_relayer(
        lookup: RelayFeeResult<Option<Address>>,
        channel_id: &ChannelId,
        relayer: &Address,
    ) -> Address {
        match lookup {
            Ok(Some(payee)) => payee,
            Ok(None) => relayer.clone(),
            Err(e) => {
                let err = RelayFeeError::PayeeResolutionFailed(format!(
                    "{relayer} on {channel_id}: {e}"
                ));
                warn!("{}; paying relayer directly", err);
                relayer.clone()
            }
        }
    }

    pub async fn all_payees<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
    ) -> RelayFeeResult<Vec<RegisteredPayee>> {
        Self::scan(overlay, PAYEE_PREFIX).await
    }

    pub async fn all_counterparty_payees<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
    ) -> RelayFeeResult<Vec<RegisteredPayee>> {
        Self::scan(overlay, COUNTERPARTY_PAYEE_PREFIX).await
    }

    async fn scan<S: StateStore + ?Sized>(
        overlay: &StateOverlay<S>,
        prefix: &str,
    ) -> RelayFeeResult<Vec<RegisteredPayee>> {
        let mut payees = Vec::new();
        for (key, value) in overlay.scan_prefix(prefix.as_bytes()).await? {
            let (channel_id, relayer) = parse_payee_key(prefix, &key).ok_or_else(|| {
                RelayFeeError::StateCorruption(format!(
                    "malformed payee key {}",
                    String::from_utf8_lossy(&key)
                ))
            })?;
            payees.push(RegisteredPayee {
                channel_id,
                relayer,
                payee: relayfee_state::decode_value(&value)?,
            });
        }
        Ok(payees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayfee_state::MemoryStateStore;
    use std::sync::Arc;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn overlay() -> StateOverlay<MemoryStateStore> {
        StateOverlay::new(Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn test_unregistered_resolves_to_relayer() {
        let registry = PayeeRegistry;
        let overlay = overlay();
        let relayer = addr("relayer1");

        assert_eq!(
            registry
                .resolve_counterparty_payee(&overlay, &ChannelId::new(0), &relayer)
                .await,
            relayer
        );
        assert_eq!(
            registry.resolve_payee(&overlay, &ChannelId::new(0), &relayer).await,
            relayer
        );
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = PayeeRegistry;
        let mut overlay = overlay();
        let channel = ChannelId::new(0);
        let relayer = addr("relayer1");

        registry
            .register_counterparty_payee(&mut overlay, &channel, &relayer, &addr("payee1"))
            .unwrap();
        registry
            .register_counterparty_payee(&mut overlay, &channel, &relayer, &addr("payee2"))
            .unwrap();

        assert_eq!(
            registry
                .resolve_counterparty_payee(&overlay, &channel, &relayer)
                .await,
            addr("payee2")
        );
    }

    #[tokio::test]
    async fn test_tables_are_independent() {
        let registry = PayeeRegistry;
        let mut overlay = overlay();
        let channel = ChannelId::new(0);
        let relayer = addr("relayer1");

        registry
            .register_payee(&mut overlay, &channel, &relayer, &addr("local"))
            .unwrap();

        assert_eq!(
            registry.resolve_payee(&overlay, &channel, &relayer).await,
            addr("local")
        );
        assert_eq!(
            registry
                .resolve_counterparty_payee(&overlay, &channel, &relayer)
                .await,
            relayer
        );
        // registration is scoped to the channel
        assert_eq!(
            registry
                .resolve_payee(&overlay, &ChannelId::new(1), &relayer)
                .await,
            relayer
        );
    }

    #[tokio::test]
    async fn test_corrupt_entry_falls_back() {
        let registry = PayeeRegistry;
        let mut overlay = overlay();
        let channel = ChannelId::new(0);
        let relayer = addr("relayer1");

        overlay.set(payee_key(&channel, &relayer), vec![0xff]);
        assert_eq!(
            registry.resolve_payee(&overlay, &channel, &relayer).await,
            relayer
        );
    }

    #[tokio::test]
    async fn test_list_registrations() {
        let registry = PayeeRegistry;
        let mut overlay = overlay();

        registry
            .register_payee(&mut overlay, &ChannelId::new(1), &addr("relayerb"), &addr("payeeb"))
            .unwrap();
        registry
            .register_payee(&mut overlay, &ChannelId::new(0), &addr("relayera"), &addr("payeea"))
            .unwrap();

        let payees = registry.all_payees(&overlay).await.unwrap();
        assert_eq!(payees.len(), 2);
        assert_eq!(payees[0].relayer, addr("relayera"));
        assert!(registry.all_counterparty_payees(&overlay).await.unwrap().is_empty());
    }
}
