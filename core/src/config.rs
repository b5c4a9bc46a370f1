//! Configuration types for relayfee

use crate::error::RelayFeeError;
use crate::traits::RelayFeeResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Chain identifier reported by the node
    pub chain_id: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// API configuration
    pub api: ApiConfig,

    /// Fee module configuration
    pub fee: FeeConfig,

    /// Logging filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "relayfee-node".to_string(),
            chain_id: "relayfee-devnet".to_string(),
            data_dir: PathBuf::from("./data"),
            api: ApiConfig::default(),
            fee: FeeConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> RelayFeeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)
            .map_err(|e| RelayFeeError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.fee.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> RelayFeeResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RelayFeeError::SerializationError(e.to_string()))
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Enable HTTP API
    pub enabled: bool,

    /// API listen address
    pub listen_addr: String,

    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8080".to_string(),
            enable_cors: true,
        }
    }
}

/// Fee middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// The only denomination accepted for relayer fees
    pub fee_denom: String,

    /// Module account holding escrowed fees
    pub escrow_account: String,

    /// Accounts that may never receive funds from the fee module
    pub blocked_addresses: Vec<String>,

    /// Upper bound on fee records appended to one packet
    pub max_records_per_packet: usize,

    /// Upper bound on the eligible relayer list of one record
    pub max_relayers_per_record: usize,

    /// Version tag advertised in the channel version metadata
    pub fee_version: String,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fee_denom: "stake".to_string(),
            escrow_account: "feeibc".to_string(),
            blocked_addresses: vec![],
            max_records_per_packet: 100,
            max_relayers_per_record: 16,
            fee_version: "ics29-1".to_string(),
        }
    }
}

impl FeeConfig {
    pub fn validate(&self) -> RelayFeeResult<()> {
        if self.fee_denom.is_empty() {
            return Err(RelayFeeError::ConfigError("fee_denom must not be empty".into()));
        }
        if self.escrow_account.is_empty() {
            return Err(RelayFeeError::ConfigError("escrow_account must not be empty".into()));
        }
        if self.blocked_addresses.iter().any(|a| a == &self.escrow_account) {
            return Err(RelayFeeError::ConfigError(
                "escrow_account cannot be a blocked address".into(),
            ));
        }
        if self.max_records_per_packet == 0 {
            return Err(RelayFeeError::ConfigError(
                "max_records_per_packet must be positive".into(),
            ));
        }
        if self.fee_version.is_empty() {
            return Err(RelayFeeError::ConfigError("fee_version must not be empty".into()));
        }
        Ok(())
    }
}
