//! HTTP client for the relayfee node

use relayfee_core::{Address, ChannelId, Coin, PacketId, PortId, Sequence};
use relayfee_fee::{
    Fee, FeeEnabledChannel, FeeReceipt, IncentivizedPacket, MsgPayPacketFee,
    MsgPayPacketFeeAsync, MsgRegisterCounterpartyPayee, MsgRegisterPayee, PacketFee,
    PacketFeeStatus,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// API Client for interacting with a relayfee node
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp: ApiResponse<T> = self.client.get(self.url(path)).send().await?.json().await?;
        resp.into_result()
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let resp: ApiResponse<T> = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await?
            .json()
            .await?;
        resp.into_result()
    }

    pub async fn status(&self) -> Result<NodeStatus, ApiError> {
        self.get("/status").await
    }

    pub async fn balance(&self, address: &str) -> Result<BalanceInfo, ApiError> {
        self.get(&format!("/balance/{address}")).await
    }

    pub async fn pay_packet_fee(&self, msg: &MsgPayPacketFee) -> Result<FeeReceipt, ApiError> {
        self.post("/fee/pay", msg).await
    }

    pub async fn pay_packet_fee_async(&self, msg: &MsgPayPacketFeeAsync) -> Result<FeeReceipt, ApiError> {
        self.post("/fee/pay-async", msg).await
    }

    pub async fn register_payee(&self, msg: &MsgRegisterPayee) -> Result<MsgRegisterPayee, ApiError> {
        self.post("/fee/payee", msg).await
    }

    pub async fn register_counterparty_payee(
        &self,
        msg: &MsgRegisterCounterpartyPayee,
    ) -> Result<MsgRegisterCounterpartyPayee, ApiError> {
        self.post("/fee/counterparty-payee", msg).await
    }

    pub async fn incentivized_packets(
        &self,
        channel: Option<(&PortId, &ChannelId)>,
    ) -> Result<Vec<IncentivizedPacket>, ApiError> {
        match channel {
            Some((port_id, channel_id)) => self.get(&format!("/fee/packets/{port_id}/{channel_id}")).await,
            None => self.get("/fee/packets").await,
        }
    }

    pub async fn packet(&self, packet_id: &PacketId) -> Result<PacketFees, ApiError> {
        self.get(&format!(
            "/fee/packet/{}/{}/{}",
            packet_id.port_id, packet_id.channel_id, packet_id.sequence
        ))
        .await
    }

    pub async fn payee(&self, channel_id: &ChannelId, relayer: &Address) -> Result<PayeeInfo, ApiError> {
        self.get(&format!("/fee/payee/{channel_id}/{relayer}")).await
    }

    pub async fn counterparty_payee(&self, channel_id: &ChannelId, relayer: &Address) -> Result<PayeeInfo, ApiError> {
        self.get(&format!("/fee/counterparty-payee/{channel_id}/{relayer}"))
            .await
    }

    pub async fn fee_channels(&self) -> Result<Vec<FeeEnabledChannel>, ApiError> {
        self.get("/fee/channels").await
    }
}

/// API response wrapper
#[derive(Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, ApiError> {
        if self.success {
            self.data.ok_or(ApiError::EmptyResponse)
        } else {
            Err(ApiError::Server(self.error.unwrap_or_default()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NodeStatus {
    pub node_name: String,
    pub chain_id: String,
    pub state_version: u64,
    pub state_root: String,
    pub fee_denom: String,
    pub escrow_account: String,
    pub escrow_balance: String,
    pub fee_locked: bool,
    pub channels: usize,
    pub fee_enabled_channels: usize,
    pub incentivized_packets: usize,
}

#[derive(Debug, Deserialize)]
pub struct BalanceInfo {
    pub address: String,
    pub balances: Vec<Coin>,
}

#[derive(Debug, Deserialize)]
pub struct PacketFees {
    pub packet_id: PacketId,
    pub status: Option<PacketFeeStatus>,
    pub total_fee: Option<Fee>,
    pub packet_fees: Vec<PacketFee>,
    pub queued_fees: Vec<PacketFee>,
}

#[derive(Debug, Deserialize)]
pub struct PayeeInfo {
    pub channel_id: ChannelId,
    pub relayer: Address,
    pub payee: Option<Address>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Empty response")]
    EmptyResponse,
}

/// Packet id from its three path components
pub fn parse_packet_id(port: &str, channel: &str, sequence: u64) -> anyhow::Result<PacketId> {
    Ok(PacketId::new(port.parse()?, channel.parse()?, Sequence(sequence)))
}
