//! Full node implementation

use crate::api::start_api_server;
use crate::runtime::NodeRuntime;
use relayfee_core::{NodeConfig, RelayFeeResult};
use relayfee_fee::FeeGenesis;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Full relayfee node
pub struct RelayFeeNode {
    runtime: Arc<NodeRuntime>,
    genesis: FeeGenesis,
}

impl RelayFeeNode {
    pub fn new(config: NodeConfig, genesis: FeeGenesis) -> RelayFeeResult<Self> {
        let runtime = Arc::new(NodeRuntime::new(config)?);
        Ok(Self { runtime, genesis })
    }

    /// Load genesis, serve the API and wait for ctrl-c
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("Starting relayfee node {}...", self.runtime.config().name);

        if self.genesis.chain_id != self.runtime.config().chain_id {
            warn!(
                "Genesis chain id {} differs from configured {}",
                self.genesis.chain_id,
                self.runtime.config().chain_id
            );
        }
        self.runtime.initialize_genesis(&self.genesis).await?;

        let api_handle = if self.runtime.config().api.enabled {
            let api_runtime = self.runtime.clone();
            let api_addr = self.runtime.config().api.listen_addr.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = start_api_server(api_runtime, &api_addr).await {
                    error!("API server error: {}", e);
                }
            }))
        } else {
            info!("HTTP API disabled");
            None
        };

        info!("Node started successfully");
        info!("Fee denom: {}", self.runtime.keeper().fee_denom());
        info!("Escrow account: {}", self.runtime.keeper().escrow_account());

        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping node..."),
            Err(e) => error!("Error waiting for shutdown signal: {}", e),
        }

        if let Some(handle) = api_handle {
            handle.abort();
        }
        info!("Node stopped");
        Ok(())
    }

    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.runtime
    }
}

/// Node builder for easier configuration
pub struct NodeBuilder {
    config: NodeConfig,
    genesis: FeeGenesis,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            genesis: FeeGenesis::devnet(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn genesis(mut self, genesis: FeeGenesis) -> Self {
        self.genesis = genesis;
        self
    }

    pub fn api_addr(mut self, addr: &str) -> Self {
        self.config.api.listen_addr = addr.to_string();
        self
    }

    pub fn build(self) -> RelayFeeResult<RelayFeeNode> {
        RelayFeeNode::new(self.config, self.genesis)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
