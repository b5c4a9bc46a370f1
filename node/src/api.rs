//! HTTP API for the relayfee node

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use relayfee_core::{
    Acknowledgement, Address, ChannelId, ChannelState, Coin, Counterparty, Order, Packet,
    PacketId, PortId, RelayFeeError, RelayFeeResult, Timestamp, Version,
};
use relayfee_fee::{
    EscrowAudit, Fee, FeeEnabledChannel, FeeEvent, FeeReceipt, IncentivizedPacket,
    MsgPayPacketFee, MsgPayPacketFeeAsync, MsgRegisterCounterpartyPayee, MsgRegisterPayee,
    PacketFee, PacketFeeStatus, SettlementReport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::runtime::NodeRuntime;

/// API state containing node runtime
pub type ApiState = Arc<NodeRuntime>;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn error_status(err: &RelayFeeError) -> StatusCode {
    match err {
        RelayFeeError::PacketNotFound(_)
        | RelayFeeError::ChannelNotFound { .. }
        | RelayFeeError::PacketCommitmentNotFound(_) => StatusCode::NOT_FOUND,
        RelayFeeError::PacketAlreadyResolved(_)
        | RelayFeeError::PacketAlreadyReceived(_)
        | RelayFeeError::ChannelClosed { .. } => StatusCode::CONFLICT,
        RelayFeeError::FeeModuleLocked => StatusCode::SERVICE_UNAVAILABLE,
        RelayFeeError::StateNotFound
        | RelayFeeError::StateCorruption(_)
        | RelayFeeError::StorageError(_)
        | RelayFeeError::SerializationError(_)
        | RelayFeeError::Internal(_)
        | RelayFeeError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn respond<T: Serialize>(result: RelayFeeResult<T>, success: StatusCode) -> ApiResult<T> {
    match result {
        Ok(data) => (success, Json(ApiResponse::ok(data))),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                warn!("Request failed: {}", e);
            }
            (status, Json(ApiResponse::err(e)))
        }
    }
}

fn packet_id(port: &str, channel: &str, seq: &str) -> RelayFeeResult<PacketId> {
    Ok(PacketId::new(port.parse()?, channel.parse()?, seq.parse()?))
}

// ============ Responses ============

/// Node status response
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatusResponse {
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

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub address: String,
    pub balances: Vec<Coin>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PacketFeesResponse {
    pub packet_id: PacketId,
    pub status: Option<PacketFeeStatus>,
    pub total_fee: Option<Fee>,
    pub packet_fees: Vec<PacketFee>,
    pub queued_fees: Vec<PacketFee>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PayeeResponse {
    pub channel_id: ChannelId,
    pub relayer: Address,
    pub payee: Option<Address>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub state: ChannelState,
    pub ordering: Order,
    pub counterparty: Counterparty,
    pub version: Version,
    pub fee_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelOpenResponse {
    pub channel_id: ChannelId,
    pub version: Option<Version>,
}

// ============ Requests ============

/// One step of the channel opening handshake on this chain
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ChannelOpenRequest {
    Init {
        port_id: PortId,
        counterparty_port_id: PortId,
        #[serde(default)]
        ordering: Order,
        /// Empty to negotiate fees with the default application version
        #[serde(default)]
        version: Version,
    },
    Try {
        port_id: PortId,
        counterparty: Counterparty,
        counterparty_version: Version,
        #[serde(default)]
        ordering: Order,
    },
    Ack {
        port_id: PortId,
        channel_id: ChannelId,
        counterparty_channel_id: ChannelId,
        counterparty_version: Version,
    },
    Confirm {
        port_id: PortId,
        channel_id: ChannelId,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelCloseRequest {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    /// Counterparty already closed its end
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendPacketRequest {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub data: String,
    /// Milliseconds since epoch; zero disables the timeout
    #[serde(default)]
    pub timeout_timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayPacketRequest {
    pub packet: Packet,
    pub relayer: Address,
    /// Present on acknowledgement relay only
    #[serde(default)]
    pub acknowledgement: Option<Acknowledgement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub port_id: PortId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize {
    100
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    let enable_cors = state.config().api.enable_cors;

    let router = Router::new()
        // Health
        .route("/health", get(health))
        .route("/status", get(status))
        // Accounts
        .route("/balance/:address", get(get_balance))
        // Fee transactions
        .route("/fee/pay", post(pay_packet_fee))
        .route("/fee/pay-async", post(pay_packet_fee_async))
        .route("/fee/payee", post(register_payee))
        .route("/fee/counterparty-payee", post(register_counterparty_payee))
        .route("/fee/refund-stale", post(refund_stale_fees))
        // Fee queries
        .route("/fee/packets", get(get_all_incentivized_packets))
        .route("/fee/packets/:port/:channel", get(get_incentivized_packets))
        .route("/fee/packet/:port/:channel/:seq", get(get_packet_fees))
        .route("/fee/payee/:channel/:relayer", get(get_payee))
        .route("/fee/counterparty-payee/:channel/:relayer", get(get_counterparty_payee))
        .route("/fee/channels", get(get_fee_channels))
        .route("/fee/audit", get(audit_escrow))
        .route("/fee/events", get(get_events))
        // Devnet base channel
        .route("/channels", get(get_channels))
        .route("/channel/open", post(open_channel))
        .route("/channel/close", post(close_channel))
        .route("/packet/send", post(send_packet))
        .route("/packet/recv", post(recv_packet))
        .route("/packet/ack", post(acknowledge_packet))
        .route("/packet/timeout", post(timeout_packet))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Health check
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn node_status(runtime: &NodeRuntime) -> RelayFeeResult<NodeStatusResponse> {
    let keeper = runtime.keeper();
    Ok(NodeStatusResponse {
        node_name: runtime.config().name.clone(),
        chain_id: runtime.config().chain_id.clone(),
        state_version: runtime.state_version().await.0,
        state_root: runtime.state_root().await.to_hex(),
        fee_denom: keeper.fee_denom().to_string(),
        escrow_account: keeper.escrow_account().to_string(),
        escrow_balance: runtime.escrow_balance().await?.0.to_string(),
        fee_locked: keeper.is_locked().await?,
        channels: runtime.channel_count(),
        fee_enabled_channels: runtime.fee_channel_count().await?,
        incentivized_packets: keeper.all_incentivized_packets().await?.len(),
    })
}

/// Node status
async fn status(State(runtime): State<ApiState>) -> impl IntoResponse {
    respond(node_status(&runtime).await, StatusCode::OK)
}

/// Get every balance of an account
async fn get_balance(State(runtime): State<ApiState>, Path(address): Path<String>) -> impl IntoResponse {
    let result = async {
        let address: Address = address.parse()?;
        let balances = runtime.balances(&address).await?;
        Ok::<_, RelayFeeError>(BalanceResponse {
            address: address.to_string(),
            balances,
        })
    }
    .await;
    respond(result, StatusCode::OK)
}

// ============ Fee transactions ============

async fn pay_packet_fee(State(runtime): State<ApiState>, Json(msg): Json<MsgPayPacketFee>) -> ApiResult<FeeReceipt> {
    let result = runtime.keeper().pay_packet_fee(msg).await;
    runtime.record_events();
    respond(result, StatusCode::CREATED)
}

async fn pay_packet_fee_async(
    State(runtime): State<ApiState>,
    Json(msg): Json<MsgPayPacketFeeAsync>,
) -> ApiResult<FeeReceipt> {
    let result = runtime.keeper().pay_packet_fee_async(msg).await;
    runtime.record_events();
    respond(result, StatusCode::CREATED)
}

async fn register_payee(State(runtime): State<ApiState>, Json(msg): Json<MsgRegisterPayee>) -> ApiResult<MsgRegisterPayee> {
    let result = runtime.keeper().register_payee(msg.clone()).await.map(|()| msg);
    runtime.record_events();
    respond(result, StatusCode::OK)
}

async fn register_counterparty_payee(
    State(runtime): State<ApiState>,
    Json(msg): Json<MsgRegisterCounterpartyPayee>,
) -> ApiResult<MsgRegisterCounterpartyPayee> {
    let result = runtime
        .keeper()
        .register_counterparty_payee(msg.clone())
        .await
        .map(|()| msg);
    runtime.record_events();
    respond(result, StatusCode::OK)
}

async fn refund_stale_fees(State(runtime): State<ApiState>, Json(req): Json<ChannelRequest>) -> ApiResult<SettlementReport> {
    let result = runtime
        .keeper()
        .refund_stale_fees(&req.port_id, &req.channel_id)
        .await;
    runtime.record_events();
    respond(result, StatusCode::OK)
}

// ============ Fee queries ============

async fn get_all_incentivized_packets(State(runtime): State<ApiState>) -> ApiResult<Vec<IncentivizedPacket>> {
    respond(runtime.keeper().all_incentivized_packets().await, StatusCode::OK)
}

async fn get_incentivized_packets(
    State(runtime): State<ApiState>,
    Path((port, channel)): Path<(String, String)>,
) -> ApiResult<Vec<IncentivizedPacket>> {
    let result = async {
        let port_id: PortId = port.parse()?;
        let channel_id: ChannelId = channel.parse()?;
        runtime.keeper().incentivized_packets(&port_id, &channel_id).await
    }
    .await;
    respond(result, StatusCode::OK)
}

async fn get_packet_fees(
    State(runtime): State<ApiState>,
    Path((port, channel, seq)): Path<(String, String, String)>,
) -> ApiResult<PacketFeesResponse> {
    let result = async {
        let packet_id = packet_id(&port, &channel, &seq)?;
        let keeper = runtime.keeper();

        let (total_fee, packet_fees) = match keeper.incentivized_packet(&packet_id).await {
            Ok(packet) => (Some(packet.total_fee), packet.packet_fees),
            Err(RelayFeeError::PacketNotFound(_)) => (None, vec![]),
            Err(e) => return Err(e),
        };
        let queued_fees = keeper.queued_fees(&packet_id).await?;
        let status = keeper.packet_status(&packet_id).await?;
        if status.is_none() && queued_fees.is_empty() {
            return Err(RelayFeeError::PacketNotFound(packet_id));
        }

        Ok::<_, RelayFeeError>(PacketFeesResponse {
            packet_id,
            status,
            total_fee,
            packet_fees,
            queued_fees,
        })
    }
    .await;
    respond(result, StatusCode::OK)
}

async fn get_payee(
    State(runtime): State<ApiState>,
    Path((channel, relayer)): Path<(String, String)>,
) -> ApiResult<PayeeResponse> {
    let result = async {
        let channel_id: ChannelId = channel.parse()?;
        let relayer: Address = relayer.parse()?;
        let payee = runtime.keeper().payee(&channel_id, &relayer).await?;
        Ok::<_, RelayFeeError>(PayeeResponse {
            channel_id,
            relayer,
            payee,
        })
    }
    .await;
    respond(result, StatusCode::OK)
}

async fn get_counterparty_payee(
    State(runtime): State<ApiState>,
    Path((channel, relayer)): Path<(String, String)>,
) -> ApiResult<PayeeResponse> {
    let result = async {
        let channel_id: ChannelId = channel.parse()?;
        let relayer: Address = relayer.parse()?;
        let payee = runtime
            .keeper()
            .counterparty_payee(&channel_id, &relayer)
            .await?;
        Ok::<_, RelayFeeError>(PayeeResponse {
            channel_id,
            relayer,
            payee,
        })
    }
    .await;
    respond(result, StatusCode::OK)
}

async fn get_fee_channels(State(runtime): State<ApiState>) -> ApiResult<Vec<FeeEnabledChannel>> {
    respond(runtime.keeper().fee_enabled_channels().await, StatusCode::OK)
}

async fn audit_escrow(State(runtime): State<ApiState>) -> ApiResult<Vec<EscrowAudit>> {
    let result = runtime.keeper().check_conservation().await;
    runtime.record_events();
    respond(result, StatusCode::OK)
}

async fn get_events(State(runtime): State<ApiState>, Query(query): Query<EventsQuery>) -> ApiResult<Vec<FeeEvent>> {
    respond(Ok(runtime.recent_events(query.limit)), StatusCode::OK)
}

// ============ Devnet base channel ============

async fn get_channels(State(runtime): State<ApiState>) -> ApiResult<Vec<ChannelResponse>> {
    let result = runtime.channels().await.map(|channels| {
        channels
            .into_iter()
            .map(|(port_id, channel_id, end, fee_enabled)| ChannelResponse {
                port_id,
                channel_id,
                state: end.state,
                ordering: end.ordering,
                counterparty: end.counterparty,
                version: end.version,
                fee_enabled,
            })
            .collect()
    });
    respond(result, StatusCode::OK)
}

async fn open_channel(State(runtime): State<ApiState>, Json(req): Json<ChannelOpenRequest>) -> ApiResult<ChannelOpenResponse> {
    let handler = runtime.handler();
    let result = match req {
        ChannelOpenRequest::Init {
            port_id,
            counterparty_port_id,
            ordering,
            version,
        } => handler
            .chan_open_init(&port_id, ordering, counterparty_port_id, version)
            .await
            .map(|(channel_id, version)| ChannelOpenResponse {
                channel_id,
                version: Some(version),
            }),
        ChannelOpenRequest::Try {
            port_id,
            counterparty,
            counterparty_version,
            ordering,
        } => handler
            .chan_open_try(&port_id, ordering, counterparty, counterparty_version)
            .await
            .map(|(channel_id, version)| ChannelOpenResponse {
                channel_id,
                version: Some(version),
            }),
        ChannelOpenRequest::Ack {
            port_id,
            channel_id,
            counterparty_channel_id,
            counterparty_version,
        } => handler
            .chan_open_ack(&port_id, &channel_id, counterparty_channel_id, counterparty_version)
            .await
            .map(|()| ChannelOpenResponse {
                channel_id,
                version: None,
            }),
        ChannelOpenRequest::Confirm {
            port_id,
            channel_id,
        } => handler
            .chan_open_confirm(&port_id, &channel_id)
            .await
            .map(|()| ChannelOpenResponse {
                channel_id,
                version: None,
            }),
    };
    runtime.record_events();
    respond(result, StatusCode::OK)
}

async fn close_channel(State(runtime): State<ApiState>, Json(req): Json<ChannelCloseRequest>) -> ApiResult<ChannelRequest> {
    let handler = runtime.handler();
    let result = if req.confirm {
        handler.chan_close_confirm(&req.port_id, &req.channel_id).await
    } else {
        handler.chan_close_init(&req.port_id, &req.channel_id).await
    };
    runtime.record_events();
    respond(
        result.map(|()| ChannelRequest {
            port_id: req.port_id,
            channel_id: req.channel_id,
        }),
        StatusCode::OK,
    )
}

async fn send_packet(State(runtime): State<ApiState>, Json(req): Json<SendPacketRequest>) -> ApiResult<Packet> {
    let result = runtime
        .handler()
        .send_packet(
            &req.port_id,
            &req.channel_id,
            req.data.into_bytes(),
            Timestamp(req.timeout_timestamp),
        )
        .await;
    runtime.record_events();
    if let Ok(packet) = &result {
        info!("Packet {} sent", packet.source_id());
    }
    respond(result, StatusCode::CREATED)
}

async fn recv_packet(State(runtime): State<ApiState>, Json(req): Json<RelayPacketRequest>) -> ApiResult<Acknowledgement> {
    let result = runtime
        .handler()
        .recv_packet(&req.packet, &req.relayer, Timestamp::now())
        .await;
    runtime.record_events();
    respond(result, StatusCode::OK)
}

async fn acknowledge_packet(State(runtime): State<ApiState>, Json(req): Json<RelayPacketRequest>) -> ApiResult<PacketId> {
    let result = match &req.acknowledgement {
        Some(ack) => runtime
            .handler()
            .acknowledge_packet(&req.packet, ack, &req.relayer)
            .await
            .map(|()| req.packet.source_id()),
        None => Err(RelayFeeError::InvalidAcknowledgement(
            "acknowledgement is required".into(),
        )),
    };
    runtime.record_events();
    respond(result, StatusCode::OK)
}

async fn timeout_packet(State(runtime): State<ApiState>, Json(req): Json<RelayPacketRequest>) -> ApiResult<PacketId> {
    let result = runtime
        .handler()
        .timeout_packet(&req.packet, &req.relayer, Timestamp::now())
        .await
        .map(|()| req.packet.source_id());
    runtime.record_events();
    respond(result, StatusCode::OK)
}

/// Start API server
pub async fn start_api_server(runtime: Arc<NodeRuntime>, listen_addr: &str) -> anyhow::Result<()> {
    let router = create_router(runtime);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("API server listening on {}", listen_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
