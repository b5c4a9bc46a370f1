//! Stateless validation of fee messages

use relayfee_core::{Address, Denom, FeeConfig, RelayFeeError, RelayFeeResult};
use std::collections::HashSet;

use crate::msgs::{
    MsgPayPacketFee, MsgPayPacketFeeAsync, MsgRegisterCounterpartyPayee, MsgRegisterPayee,
};
use crate::types::{Fee, PacketFee};

/// Checks message structure before any state is touched
pub struct FeeMsgValidator {
    fee_denom: Denom,
    max_relayers: usize,
    /// Accounts that cannot pay fees or be registered as payees
    blocked: HashSet<String>,
}

impl FeeMsgValidator {
    pub fn new(config: &FeeConfig) -> RelayFeeResult<Self> {
        Ok(Self {
            fee_denom: Denom::new(config.fee_denom.clone())
                .map_err(|e| RelayFeeError::ConfigError(e.to_string()))?,
            max_relayers: config.max_relayers_per_record,
            blocked: config
                .blocked_addresses
                .iter()
                .chain(std::iter::once(&config.escrow_account))
                .cloned()
                .collect(),
        })
    }

    pub fn fee_denom(&self) -> &Denom {
        &self.fee_denom
    }

    pub fn validate_fee(&self, fee: &Fee) -> RelayFeeResult<()> {
        if fee.denom != self.fee_denom {
            return Err(RelayFeeError::DenomMismatch {
                expected: self.fee_denom.to_string(),
                got: fee.denom.to_string(),
            });
        }

        // Overflow is as invalid as zero
        if fee.total()?.is_zero() {
            return Err(RelayFeeError::InvalidFee(
                "at least one of recv, ack or timeout fee must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn validate_relayers(&self, relayers: &[Address]) -> RelayFeeResult<()> {
        if relayers.len() > self.max_relayers {
            return Err(RelayFeeError::InvalidFee(format!(
                "{} eligible relayers exceed maximum {}",
                relayers.len(),
                self.max_relayers
            )));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = relayers.iter().find(|r| !seen.insert(*r)) {
            return Err(RelayFeeError::InvalidFee(format!("duplicate relayer {dup}")));
        }

        Ok(())
    }

    /// The payer must be able to receive its refund, and the escrow account
    /// cannot pay into itself
    pub fn validate_payer(&self, payer: &Address) -> RelayFeeResult<()> {
        if self.blocked.contains(payer.as_str()) {
            return Err(RelayFeeError::TransferBlocked(payer.to_string()));
        }
        Ok(())
    }

    pub fn validate_packet_fee(&self, packet_fee: &PacketFee) -> RelayFeeResult<()> {
        self.validate_payer(&packet_fee.refund_address)?;
        self.validate_fee(&packet_fee.fee)?;
        self.validate_relayers(&packet_fee.relayers)
    }

    pub fn validate_pay_packet_fee(&self, msg: &MsgPayPacketFee) -> RelayFeeResult<()> {
        self.validate_payer(&msg.signer)?;
        self.validate_fee(&msg.fee)?;
        self.validate_relayers(&msg.relayers)
    }

    pub fn validate_pay_packet_fee_async(&self, msg: &MsgPayPacketFeeAsync) -> RelayFeeResult<()> {
        self.validate_packet_fee(&msg.packet_fee)
    }

    pub fn validate_register_payee(&self, msg: &MsgRegisterPayee) -> RelayFeeResult<()> {
        if self.blocked.contains(msg.payee.as_str()) {
            return Err(RelayFeeError::TransferBlocked(msg.payee.to_string()));
        }
        Ok(())
    }

    /// Counterparty addresses live on the other chain; only the blocked list
    /// of this chain applies to the relayer registering them
    pub fn validate_register_counterparty_payee(
        &self,
        msg: &MsgRegisterCounterpartyPayee,
    ) -> RelayFeeResult<()> {
        if self.blocked.contains(msg.relayer.as_str()) {
            return Err(RelayFeeError::InvalidAddress(format!(
                "module account {} cannot register a payee",
                msg.relayer
            )));
        }
        Ok(())
    }
}
