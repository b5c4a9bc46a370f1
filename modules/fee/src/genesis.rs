//! Genesis state for the fee module
//!
//! A genesis file carries account balances and the complete fee state of a
//! chain, so a node can start from scratch or from an exported snapshot.

use relayfee_core::{Address, Amount, ChannelKeeper, Coin, Denom, PacketId, RelayFeeError, RelayFeeResult};
use relayfee_state::StateStore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::keeper::FeeKeeper;
use crate::keys::{fee_enabled_key, FEE_LOCKED_KEY};
use crate::types::{FeeEnabledChannel, PacketFee, RegisteredPayee};

/// Genesis balance entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub denom: String,
    /// Decimal string, so large balances survive JSON tooling
    pub amount: String,
}

/// Fee records of one packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedPacketFees {
    pub packet_id: PacketId,
    pub packet_fees: Vec<PacketFee>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeGenesis {
    pub chain_id: String,
    #[serde(default)]
    pub allocations: Vec<GenesisAllocation>,
    #[serde(default)]
    pub fee_enabled_channels: Vec<FeeEnabledChannel>,
    #[serde(default)]
    pub registered_payees: Vec<RegisteredPayee>,
    #[serde(default)]
    pub registered_counterparty_payees: Vec<RegisteredPayee>,
    #[serde(default)]
    pub identified_fees: Vec<IdentifiedPacketFees>,
    /// Records paid for packets that were not sent yet
    #[serde(default)]
    pub queued_fees: Vec<IdentifiedPacketFees>,
    #[serde(default)]
    pub locked: bool,
}

impl Default for FeeGenesis {
    fn default() -> Self {
        Self {
            chain_id: "relayfee-1".to_string(),
            allocations: vec![],
            fee_enabled_channels: vec![],
            registered_payees: vec![],
            registered_counterparty_payees: vec![],
            identified_fees: vec![],
            queued_fees: vec![],
            locked: false,
        }
    }
}

impl FeeGenesis {
    pub fn devnet() -> Self {
        Self {
            chain_id: "relayfee-devnet".to_string(),
            ..Default::default()
        }
    }

    pub fn with_chain_id(mut self, chain_id: &str) -> Self {
        self.chain_id = chain_id.to_string();
        self
    }

    pub fn add_allocation(mut self, address: &str, denom: &str, amount: u128) -> Self {
        self.allocations.push(GenesisAllocation {
            address: address.to_string(),
            denom: denom.to_string(),
            amount: amount.to_string(),
        });
        self
    }

    pub fn parse_allocations(&self) -> RelayFeeResult<Vec<(Address, Coin)>> {
        self.allocations
            .iter()
            .map(|alloc| {
                let address = Address::new(alloc.address.clone())?;
                let denom = Denom::new(alloc.denom.clone())?;
                let amount: u128 = alloc.amount.parse().map_err(|e| {
                    RelayFeeError::ConfigError(format!("invalid genesis amount {}: {}", alloc.amount, e))
                })?;
                Ok((address, Coin::new(denom, Amount(amount))))
            })
            .collect()
    }

    /// Sum of all allocations in `denom`
    pub fn total_supply(&self, denom: &Denom) -> RelayFeeResult<Amount> {
        self.parse_allocations()?
            .into_iter()
            .filter(|(_, coin)| &coin.denom == denom)
            .try_fold(Amount::ZERO, |total, (_, coin)| {
                total
                    .checked_add(coin.amount)
                    .ok_or_else(|| RelayFeeError::ConfigError("genesis supply overflow".into()))
            })
    }

    pub fn to_json(&self) -> RelayFeeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| RelayFeeError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> RelayFeeResult<Self> {
        serde_json::from_str(json).map_err(|e| RelayFeeError::DeserializationError(e.to_string()))
    }
}

impl<S: StateStore + ?Sized, C: ChannelKeeper + ?Sized> FeeKeeper<S, C> {
    /// Load a genesis state. Fails without writing anything when the escrow
    /// allocation does not cover the imported records.
    pub async fn init_genesis(&self, genesis: &FeeGenesis) -> RelayFeeResult<()> {
        info!("Initializing fee genesis for chain: {}", genesis.chain_id);

        let _guard = self.exec_lock.lock().await;
        let mut overlay = self.overlay();
        let bank = self.ledger.bank();

        for (address, coin) in genesis.parse_allocations()? {
            bank.mint(&mut overlay, &address, &coin).await?;
        }

        for channel in &genesis.fee_enabled_channels {
            overlay.set(fee_enabled_key(&channel.port_id, &channel.channel_id), vec![1]);
        }
        for entry in &genesis.registered_payees {
            self.payees
                .register_payee(&mut overlay, &entry.channel_id, &entry.relayer, &entry.payee)?;
        }
        for entry in &genesis.registered_counterparty_payees {
            self.payees.register_counterparty_payee(
                &mut overlay,
                &entry.channel_id,
                &entry.relayer,
                &entry.payee,
            )?;
        }

        for fees in &genesis.identified_fees {
            self.ledger
                .restore_records(&mut overlay, &fees.packet_id, &fees.packet_fees, false)?;
        }
        for fees in &genesis.queued_fees {
            self.ledger
                .restore_records(&mut overlay, &fees.packet_id, &fees.packet_fees, true)?;
        }

        if let Some(short) = self
            .audit(&overlay)
            .await?
            .into_iter()
            .find(|audit| !audit.is_covered())
        {
            return Err(RelayFeeError::ConfigError(format!(
                "genesis escrow holds {} {} but records total {}",
                short.escrow_balance, short.denom, short.outstanding
            )));
        }

        if genesis.locked {
            overlay.set(FEE_LOCKED_KEY.to_vec(), vec![1]);
        }
        overlay.commit().await?;

        info!(
            "Fee genesis loaded: {} accounts, {} fee channels, {} incentivized packets",
            genesis.allocations.len(),
            genesis.fee_enabled_channels.len(),
            genesis.identified_fees.len()
        );
        Ok(())
    }

    /// Snapshot of balances and fee state, loadable with [`FeeKeeper::init_genesis`]
    pub async fn export_genesis(&self, chain_id: &str) -> RelayFeeResult<FeeGenesis> {
        let _guard = self.exec_lock.lock().await;
        let overlay = self.overlay();

        let allocations = self
            .ledger
            .bank()
            .all_balances(&overlay)
            .await?
            .into_iter()
            .map(|(address, coin)| GenesisAllocation {
                address: address.to_string(),
                denom: coin.denom.to_string(),
                amount: coin.amount.0.to_string(),
            })
            .collect();

        let identified = |records: Vec<(PacketId, Vec<PacketFee>)>| {
            records
                .into_iter()
                .map(|(packet_id, packet_fees)| IdentifiedPacketFees {
                    packet_id,
                    packet_fees,
                })
                .collect::<Vec<_>>()
        };

        Ok(FeeGenesis {
            chain_id: chain_id.to_string(),
            allocations,
            fee_enabled_channels: self.fee_enabled_channels().await?,
            registered_payees: self.payees.all_payees(&overlay).await?,
            registered_counterparty_payees: self.payees.all_counterparty_payees(&overlay).await?,
            identified_fees: identified(
                self.ledger
                    .scan_records(&overlay, crate::keys::PACKET_FEES_PREFIX)
                    .await?,
            ),
            queued_fees: identified(
                self.ledger
                    .scan_records(&overlay, crate::keys::QUEUED_FEES_PREFIX)
                    .await?,
            ),
            locked: overlay.exists(FEE_LOCKED_KEY).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannelKeeper;
    use crate::types::Fee;
    use relayfee_core::{ChannelId, FeeConfig, PortId, Sequence};
    use relayfee_state::MemoryStateStore;
    use std::sync::Arc;

    type Keeper = FeeKeeper<MemoryStateStore, InMemoryChannelKeeper>;

    fn keeper() -> Keeper {
        FeeKeeper::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(InMemoryChannelKeeper::new()),
            FeeConfig::default(),
        )
        .unwrap()
    }

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn record() -> IdentifiedPacketFees {
        IdentifiedPacketFees {
            packet_id: PacketId::new(PortId::transfer(), ChannelId::new(0), Sequence(4)),
            packet_fees: vec![PacketFee::new(
                Fee::new(Denom::new("stake").unwrap(), Amount(50), Amount(25), Amount(10)),
                addr("payer1"),
                vec![],
            )],
        }
    }

    fn genesis() -> FeeGenesis {
        let mut genesis = FeeGenesis::devnet()
            .add_allocation("payer1", "stake", 1_000)
            .add_allocation("feeibc", "stake", 85);
        genesis.fee_enabled_channels.push(FeeEnabledChannel {
            port_id: PortId::transfer(),
            channel_id: ChannelId::new(0),
        });
        genesis.registered_payees.push(RegisteredPayee {
            channel_id: ChannelId::new(0),
            relayer: addr("relayer1"),
            payee: addr("payee1"),
        });
        genesis.identified_fees.push(record());
        genesis
    }

    #[test]
    fn test_genesis_json() {
        let config = genesis();
        let json = config.to_json().unwrap();
        let restored = FeeGenesis::from_json(&json).unwrap();

        assert_eq!(restored.chain_id, "relayfee-devnet");
        assert_eq!(restored.identified_fees, config.identified_fees);
        assert_eq!(
            restored.total_supply(&Denom::new("stake").unwrap()).unwrap(),
            Amount(1_085)
        );
    }

    #[test]
    fn test_bad_amount_rejected() {
        let mut config = FeeGenesis::devnet();
        config.allocations.push(GenesisAllocation {
            address: "payer1".into(),
            denom: "stake".into(),
            amount: "lots".into(),
        });
        assert!(config.parse_allocations().is_err());
    }

    #[tokio::test]
    async fn test_init_and_export() {
        let keeper = keeper();
        keeper.init_genesis(&genesis()).await.unwrap();

        let packet_id = record().packet_id;
        assert!(keeper
            .is_fee_enabled(&PortId::transfer(), &ChannelId::new(0))
            .await
            .unwrap());
        assert_eq!(
            keeper.payee(&ChannelId::new(0), &addr("relayer1")).await.unwrap(),
            Some(addr("payee1"))
        );
        assert_eq!(keeper.total_fees(&packet_id).await.unwrap().recv_fee, Amount(50));
        assert_eq!(keeper.all_incentivized_packets().await.unwrap().len(), 1);
        assert!(keeper.check_conservation().await.unwrap().iter().all(|a| a.is_covered()));

        let exported = keeper.export_genesis("relayfee-devnet").await.unwrap();
        assert_eq!(exported.allocations.len(), 2);
        assert_eq!(exported.identified_fees, vec![record()]);
        assert_eq!(exported.registered_payees.len(), 1);
        assert!(!exported.locked);
    }

    #[tokio::test]
    async fn test_uncovered_records_rejected() {
        let keeper = keeper();
        let mut config = genesis();
        config.allocations.retain(|a| a.address != "feeibc");

        let err = keeper.init_genesis(&config).await.unwrap_err();
        assert!(matches!(err, RelayFeeError::ConfigError(_)));
        assert_eq!(
            keeper
                .balance(&addr("payer1"), &Denom::new("stake").unwrap())
                .await
                .unwrap(),
            Amount::ZERO
        );
    }
}
