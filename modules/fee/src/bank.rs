//! Account balances
//!
//! The fee module only ever moves coins between accounts; it never mints
//! outside genesis and never burns. Every transfer is staged on the caller's
//! overlay, so a failed transaction leaves no partial debit behind.

use relayfee_core::{Address, Amount, Coin, Denom, RelayFeeError, RelayFeeResult};
use relayfee_state::{StateOverlay, StateStore};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::keys::{balance_key, parse_balance_key, BANK_PREFIX};

/// Per-denomination account balances
#[derive(Debug, Clone, Default)]
pub struct Bank {
    blocked: HashSet<Address>,
}

impl Bank {
    pub fn new(blocked: impl IntoIterator<Item = Address>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }

    /// Whether `address` is barred from receiving funds
    pub fn is_blocked(&self, address: &Address) -> bool {
        self.blocked.contains(address)
    }

    pub async fn balance<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
        address: &Address,
        denom: &Denom,
    ) -> RelayFeeResult<Amount> {
        Ok(overlay
            .get_value::<Amount>(&balance_key(address, denom))
            .await?
            .unwrap_or(Amount::ZERO))
    }

    /// All non-zero balances, ordered by address then denomination
    pub async fn all_balances<S: StateStore + ?Sized>(
        &self,
        overlay: &StateOverlay<S>,
    ) -> RelayFeeResult<Vec<(Address, Coin)>> {
        let mut balances = Vec::new();
        for (key, value) in overlay.scan_prefix(BANK_PREFIX.as_bytes()).await? {
            let (address, denom) = parse_balance_key(&key).ok_or_else(|| {
                RelayFeeError::StateCorruption(format!(
                    "malformed balance key {}",
                    String::from_utf8_lossy(&key)
                ))
            })?;
            let amount: Amount = relayfee_state::decode_value(&value)?;
            if !amount.is_zero() {
                balances.push((address, Coin::new(denom, amount)));
            }
        }
        Ok(balances)
    }

    fn write_balance<S: StateStore + ?Sized>(
        overlay: &mut StateOverlay<S>,
        address: &Address,
        denom: &Denom,
        amount: Amount,
    ) -> RelayFeeResult<()> {
        let key = balance_key(address, denom);
        if amount.is_zero() {
            overlay.delete(key);
            Ok(())
        } else {
            overlay.set_value(key, &amount)
        }
    }

    /// Move `coin` from `from` to `to`
    pub async fn send<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        from: &Address,
        to: &Address,
        coin: &Coin,
    ) -> RelayFeeResult<()> {
        if self.is_blocked(to) {
            return Err(RelayFeeError::TransferBlocked(to.to_string()));
        }
        if from == to {
            return Err(RelayFeeError::InvalidAddress(format!("{from} cannot send to itself")));
        }
        if coin.amount.is_zero() {
            return Ok(());
        }

        let sender_balance = self.balance(overlay, from, &coin.denom).await?;
        let remaining = sender_balance
            .checked_sub(coin.amount)
            .ok_or(RelayFeeError::InsufficientFunds {
                required: coin.amount.0,
                available: sender_balance.0,
            })?;

        let recipient_balance = self.balance(overlay, to, &coin.denom).await?;
        let credited = recipient_balance
            .checked_add(coin.amount)
            .ok_or_else(|| RelayFeeError::Internal(format!("balance overflow for {to}")))?;

        Self::write_balance(overlay, from, &coin.denom, remaining)?;
        Self::write_balance(overlay, to, &coin.denom, credited)?;

        debug!("Transfer {} -> {} {}", from, to, coin);
        Ok(())
    }

    /// Credit `coin` to `to` out of thin air (genesis only)
    pub async fn mint<S: StateStore + ?Sized>(
        &self,
        overlay: &mut StateOverlay<S>,
        to: &Address,
        coin: &Coin,
    ) -> RelayFeeResult<()> {
        let balance = self.balance(overlay, to, &coin.denom).await?;
        let credited = balance
            .checked_add(coin.amount)
            .ok_or_else(|| RelayFeeError::Internal(format!("balance overflow for {to}")))?;
        Self::write_balance(overlay, to, &coin.denom, credited)?;

        info!("Minted {} to {}", coin, to);
        Ok(())
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

    fn stake(amount: u128) -> Coin {
        Coin::new(Denom::new("stake").unwrap(), Amount(amount))
    }

    async fn funded_overlay(bank: &Bank) -> StateOverlay<MemoryStateStore> {
        let mut overlay = StateOverlay::new(Arc::new(MemoryStateStore::new()));
        bank.mint(&mut overlay, &addr("alice"), &stake(1000)).await.unwrap();
        overlay
    }

    #[tokio::test]
    async fn test_send_moves_funds() {
        let bank = Bank::default();
        let mut overlay = funded_overlay(&bank).await;
        let denom = Denom::new("stake").unwrap();

        bank.send(&mut overlay, &addr("alice"), &addr("bob"), &stake(300))
            .await
            .unwrap();

        assert_eq!(bank.balance(&overlay, &addr("alice"), &denom).await.unwrap(), Amount(700));
        assert_eq!(bank.balance(&overlay, &addr("bob"), &denom).await.unwrap(), Amount(300));
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let bank = Bank::default();
        let mut overlay = funded_overlay(&bank).await;

        let err = bank
            .send(&mut overlay, &addr("alice"), &addr("bob"), &stake(1001))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayFeeError::InsufficientFunds {
                required: 1001,
                available: 1000
            }
        ));
    }

    #[tokio::test]
    async fn test_blocked_recipient() {
        let bank = Bank::new([addr("blocked")]);
        let mut overlay = funded_overlay(&bank).await;

        let err = bank
            .send(&mut overlay, &addr("alice"), &addr("blocked"), &stake(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayFeeError::TransferBlocked(_)));
    }

    #[tokio::test]
    async fn test_self_transfer_rejected() {
        let bank = Bank::default();
        let mut overlay = funded_overlay(&bank).await;
        let denom = Denom::new("stake").unwrap();

        let err = bank
            .send(&mut overlay, &addr("alice"), &addr("alice"), &stake(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayFeeError::InvalidAddress(_)));
        assert_eq!(bank.balance(&overlay, &addr("alice"), &denom).await.unwrap(), Amount(1000));
    }

    #[tokio::test]
    async fn test_all_balances_skips_emptied_accounts() {
        let bank = Bank::default();
        let mut overlay = funded_overlay(&bank).await;

        bank.send(&mut overlay, &addr("alice"), &addr("bob"), &stake(1000))
            .await
            .unwrap();

        let balances = bank.all_balances(&overlay).await.unwrap();
        assert_eq!(balances, vec![(addr("bob"), stake(1000))]);
    }
}
