//! Node runtime combining the store, the base channel and the fee module

use async_trait::async_trait;
use parking_lot::RwLock;
use relayfee_core::{
    Acknowledgement, Address, Amount, ChannelId, ChannelModule, Coin, Denom, NodeConfig, Packet,
    PacketModule, RelayFeeResult, StateProvider, StateRoot, StateVersion,
};
use relayfee_fee::{
    ChannelHandler, FeeEvent, FeeGenesis, FeeKeeper, FeeMiddleware, InMemoryChannelKeeper,
};
use relayfee_state::{create_memory_store, MemoryStateStore, SharedMemoryStateStore};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;

/// Number of fee events kept for the events endpoint
const RECENT_EVENTS: usize = 1_000;

pub type NodeKeeper = FeeKeeper<MemoryStateStore, InMemoryChannelKeeper>;
pub type NodeHandler = ChannelHandler<FeeMiddleware<DevnetApp, MemoryStateStore, InMemoryChannelKeeper>>;

/// Application bound to every devnet port. Accepts any non-empty packet.
pub struct DevnetApp;

#[async_trait]
impl PacketModule for DevnetApp {
    async fn on_recv_packet(&self, packet: &Packet, _relayer: &Address) -> Acknowledgement {
        if packet.data.is_empty() {
            Acknowledgement::error("empty packet data")
        } else {
            Acknowledgement::success()
        }
    }

    async fn on_acknowledgement_packet(
        &self,
        _packet: &Packet,
        _acknowledgement: &Acknowledgement,
        _relayer: &Address,
    ) -> RelayFeeResult<()> {
        Ok(())
    }

    async fn on_timeout_packet(&self, _packet: &Packet, _relayer: &Address) -> RelayFeeResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ChannelModule for DevnetApp {}

/// Node runtime managing all components
pub struct NodeRuntime {
    config: NodeConfig,
    state: SharedMemoryStateStore,
    keeper: Arc<NodeKeeper>,
    handler: NodeHandler,
    events: RwLock<VecDeque<FeeEvent>>,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig) -> RelayFeeResult<Self> {
        let state = create_memory_store();
        let channels = Arc::new(InMemoryChannelKeeper::new());
        let keeper = Arc::new(FeeKeeper::new(
            state.clone(),
            channels.clone(),
            config.fee.clone(),
        )?);
        let handler = ChannelHandler::new(channels, FeeMiddleware::new(DevnetApp, keeper.clone()));

        Ok(Self {
            config,
            state,
            keeper,
            handler,
            events: RwLock::new(VecDeque::new()),
        })
    }

    /// Initialize genesis state
    pub async fn initialize_genesis(&self, genesis: &FeeGenesis) -> RelayFeeResult<()> {
        self.keeper.init_genesis(genesis).await?;
        self.record_events();

        info!(
            "Genesis initialized for {}, state root: {}",
            genesis.chain_id,
            self.state_root().await
        );
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn keeper(&self) -> &Arc<NodeKeeper> {
        &self.keeper
    }

    pub fn handler(&self) -> &NodeHandler {
        &self.handler
    }

    pub async fn state_version(&self) -> StateVersion {
        self.state.version().await
    }

    pub async fn state_root(&self) -> StateRoot {
        self.state.root().await
    }

    /// Move events out of the keeper into the recent-events buffer. Called
    /// after every request that may have changed fee state.
    pub fn record_events(&self) -> usize {
        let drained = self.keeper.drain_events();
        let count = drained.len();

        let mut events = self.events.write();
        for event in drained {
            info!(event = %serde_json::to_string(&event).unwrap_or_default(), "fee event");
            events.push_back(event);
        }
        while events.len() > RECENT_EVENTS {
            events.pop_front();
        }
        count
    }

    /// Most recent fee events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<FeeEvent> {
        let events = self.events.read();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub async fn balances(&self, address: &Address) -> RelayFeeResult<Vec<Coin>> {
        self.keeper.balances(address).await
    }

    pub async fn escrow_balance(&self) -> RelayFeeResult<Amount> {
        let denom: &Denom = self.keeper.fee_denom();
        self.keeper.balance(self.keeper.escrow_account(), denom).await
    }

    pub async fn fee_channel_count(&self) -> RelayFeeResult<usize> {
        Ok(self.keeper.fee_enabled_channels().await?.len())
    }

    pub fn channel_count(&self) -> usize {
        self.handler.channels().channels().len()
    }

    /// Channels on this chain, with whether fees are enabled on each
    pub async fn channels(&self) -> RelayFeeResult<Vec<(relayfee_core::PortId, ChannelId, relayfee_core::ChannelEnd, bool)>> {
        let mut out = Vec::new();
        for (port_id, channel_id, end) in self.handler.channels().channels() {
            let enabled = self.keeper.is_fee_enabled(&port_id, &channel_id).await?;
            out.push((port_id, channel_id, end, enabled));
        }
        Ok(out)
    }
}
