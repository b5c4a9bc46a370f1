//! Fee middleware
//!
//! Wraps an application module and adds relayer incentivization to every
//! channel whose version negotiated fee support. The wrapped application
//! always runs first; fee logic runs only when it succeeds, and a failure
//! in fee logic never fails the packet callback.

use async_trait::async_trait;
use relayfee_core::channel::base64_bytes;
use relayfee_core::{
    Acknowledgement, Address, ChannelId, ChannelKeeper, ChannelModule, Counterparty, Order,
    Packet, PacketId, PacketModule, PortId, RelayFeeError, RelayFeeResult, Version,
};
use relayfee_state::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::keeper::FeeKeeper;

/// Channel version of a fee-enabled channel, e.g.
/// `{"fee_version":"ics29-1","app_version":"ics20-1"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeMetadata {
    pub fee_version: String,
    pub app_version: String,
}

impl FeeMetadata {
    pub fn new(fee_version: impl Into<String>, app_version: &Version) -> Self {
        Self {
            fee_version: fee_version.into(),
            app_version: app_version.as_str().to_string(),
        }
    }

    /// `None` when the version is a plain application version
    pub fn parse(version: &Version) -> Option<Self> {
        serde_json::from_str(version.as_str()).ok()
    }

    pub fn app_version(&self) -> Version {
        Version::new(self.app_version.clone())
    }

    pub fn to_version(&self) -> RelayFeeResult<Version> {
        Ok(Version::new(serde_json::to_string(self)?))
    }
}

/// Acknowledgement written on fee-enabled channels. Carries the forward
/// relayer's payout address back to the sending chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncentivizedAcknowledgement {
    #[serde(with = "base64_bytes")]
    pub app_acknowledgement: Vec<u8>,
    pub forward_relayer_address: String,
    pub underlying_app_success: bool,
}

impl IncentivizedAcknowledgement {
    pub fn wrap(app_ack: &Acknowledgement, forward_relayer: &Address) -> Self {
        Self {
            app_acknowledgement: app_ack.as_bytes().to_vec(),
            forward_relayer_address: forward_relayer.to_string(),
            underlying_app_success: app_ack.is_success(),
        }
    }

    pub fn decode(ack: &Acknowledgement) -> RelayFeeResult<Self> {
        serde_json::from_slice(ack.as_bytes())
            .map_err(|e| RelayFeeError::InvalidAcknowledgement(e.to_string()))
    }

    pub fn encode(&self) -> RelayFeeResult<Acknowledgement> {
        Ok(Acknowledgement::from_bytes(serde_json::to_vec(self)?))
    }

    pub fn app_acknowledgement(&self) -> Acknowledgement {
        Acknowledgement::from_bytes(self.app_acknowledgement.clone())
    }

    /// The reported forward relayer; an empty or malformed address counts as absent
    pub fn forward_relayer(&self) -> Option<Address> {
        if self.forward_relayer_address.is_empty() {
            return None;
        }
        match Address::new(self.forward_relayer_address.clone()) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Ignoring forward relayer in acknowledgement: {}", e);
                None
            }
        }
    }
}

pub struct FeeMiddleware<M, S: StateStore + ?Sized, C: ChannelKeeper + ?Sized> {
    app: M,
    keeper: Arc<FeeKeeper<S, C>>,
}

impl<M, S: StateStore + ?Sized, C: ChannelKeeper + ?Sized> FeeMiddleware<M, S, C> {
    pub fn new(app: M, keeper: Arc<FeeKeeper<S, C>>) -> Self {
        Self { app, keeper }
    }

    pub fn app(&self) -> &M {
        &self.app
    }

    pub fn keeper(&self) -> &Arc<FeeKeeper<S, C>> {
        &self.keeper
    }

    async fn fee_enabled(&self, port_id: &PortId, channel_id: &ChannelId) -> bool {
        match self.keeper.is_fee_enabled(port_id, channel_id).await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("Cannot read fee flag of {}/{}: {}", port_id, channel_id, e);
                false
            }
        }
    }

    fn expect_fee_version(&self, metadata: &FeeMetadata) -> RelayFeeResult<()> {
        let expected = &self.keeper.config().fee_version;
        if &metadata.fee_version != expected {
            return Err(RelayFeeError::InvalidVersion(format!(
                "expected fee version {expected}, got {}",
                metadata.fee_version
            )));
        }
        Ok(())
    }

    fn log_distribution(packet_id: &PacketId, result: RelayFeeResult<crate::types::SettlementReport>) {
        match result {
            Ok(report) if report.is_complete() => {
                debug!("Distributed {} fee payouts for {}", report.payouts.len(), packet_id)
            }
            Ok(report) => warn!(
                "Fees for {} partly undistributed: {} records remain escrowed",
                packet_id,
                report.retained.len()
            ),
            Err(RelayFeeError::NoFeesInEscrow(_)) => debug!("No fees escrowed for {}", packet_id),
            Err(e) => warn!("Fee distribution for {} failed: {}", packet_id, e),
        }
    }

    async fn refund_on_close(&self, port_id: &PortId, channel_id: &ChannelId) {
        if !self.fee_enabled(port_id, channel_id).await {
            return;
        }
        match self
            .keeper
            .refund_fees_on_channel_closure(port_id, channel_id)
            .await
        {
            Ok(report) if report.is_complete() => {
                info!(
                    "Channel {}/{} closed: refunded {} fee payouts",
                    port_id,
                    channel_id,
                    report.payouts.len()
                );
            }
            Ok(report) => warn!(
                "Channel {}/{} closed with {} fee records left in escrow",
                port_id,
                channel_id,
                report.retained.len()
            ),
            Err(e) => warn!("Fee refund on closing {}/{} failed: {}", port_id, channel_id, e),
        }
    }
}

#[async_trait]
impl<M, S, C> PacketModule for FeeMiddleware<M, S, C>
where
    M: PacketModule,
    S: StateStore + ?Sized,
    C: ChannelKeeper + ?Sized,
{
    async fn on_send_packet(&self, packet: &Packet) -> RelayFeeResult<()> {
        self.app.on_send_packet(packet).await?;

        if self.fee_enabled(&packet.source_port, &packet.source_channel).await {
            let packet_id = packet.source_id();
            if let Err(e) = self.keeper.on_packet_sent(&packet_id).await {
                warn!("Prepaid fees for {} not activated: {}", packet_id, e);
            }
        }
        Ok(())
    }

    async fn on_recv_packet(&self, packet: &Packet, relayer: &Address) -> Acknowledgement {
        let ack = self.app.on_recv_packet(packet, relayer).await;

        if !self
            .fee_enabled(&packet.destination_port, &packet.destination_channel)
            .await
        {
            return ack;
        }

        let forward_relayer = self
            .keeper
            .resolve_counterparty_payee(&packet.destination_channel, relayer)
            .await;
        match IncentivizedAcknowledgement::wrap(&ack, &forward_relayer).encode() {
            Ok(wrapped) => wrapped,
            Err(e) => {
                warn!("Cannot wrap acknowledgement for {}: {}", packet.destination_id(), e);
                ack
            }
        }
    }

    async fn on_acknowledgement_packet(
        &self,
        packet: &Packet,
        acknowledgement: &Acknowledgement,
        relayer: &Address,
    ) -> RelayFeeResult<()> {
        if !self
            .fee_enabled(&packet.source_port, &packet.source_channel)
            .await
        {
            return self
                .app
                .on_acknowledgement_packet(packet, acknowledgement, relayer)
                .await;
        }

        let incentivized = IncentivizedAcknowledgement::decode(acknowledgement)?;
        self.app
            .on_acknowledgement_packet(packet, &incentivized.app_acknowledgement(), relayer)
            .await?;

        let packet_id = packet.source_id();
        let result = self
            .keeper
            .distribute_on_acknowledgement(&packet_id, incentivized.forward_relayer(), relayer)
            .await;
        Self::log_distribution(&packet_id, result);
        Ok(())
    }

    async fn on_timeout_packet(&self, packet: &Packet, relayer: &Address) -> RelayFeeResult<()> {
        self.app.on_timeout_packet(packet, relayer).await?;

        if self
            .fee_enabled(&packet.source_port, &packet.source_channel)
            .await
        {
            let packet_id = packet.source_id();
            let result = self.keeper.distribute_on_timeout(&packet_id, relayer).await;
            Self::log_distribution(&packet_id, result);
        }
        Ok(())
    }
}

#[async_trait]
impl<M, S, C> ChannelModule for FeeMiddleware<M, S, C>
where
    M: ChannelModule,
    S: StateStore + ?Sized,
    C: ChannelKeeper + ?Sized,
{
    async fn on_chan_open_init(
        &self,
        order: Order,
        port_id: &PortId,
        channel_id: &ChannelId,
        counterparty: &Counterparty,
        version: &Version,
    ) -> RelayFeeResult<Version> {
        // An empty proposal opts into fees with the application's default version
        let metadata = if version.is_empty() {
            Some(FeeMetadata::new(self.keeper.config().fee_version.clone(), version))
        } else {
            FeeMetadata::parse(version)
        };

        let Some(metadata) = metadata else {
            return self
                .app
                .on_chan_open_init(order, port_id, channel_id, counterparty, version)
                .await;
        };
        self.expect_fee_version(&metadata)?;

        let app_version = self
            .app
            .on_chan_open_init(order, port_id, channel_id, counterparty, &metadata.app_version())
            .await?;
        self.keeper.set_fee_enabled(port_id, channel_id, true).await?;

        FeeMetadata::new(metadata.fee_version, &app_version).to_version()
    }

    async fn on_chan_open_try(
        &self,
        order: Order,
        port_id: &PortId,
        channel_id: &ChannelId,
        counterparty: &Counterparty,
        counterparty_version: &Version,
    ) -> RelayFeeResult<Version> {
        let Some(metadata) = FeeMetadata::parse(counterparty_version) else {
            return self
                .app
                .on_chan_open_try(order, port_id, channel_id, counterparty, counterparty_version)
                .await;
        };
        self.expect_fee_version(&metadata)?;

        let app_version = self
            .app
            .on_chan_open_try(order, port_id, channel_id, counterparty, &metadata.app_version())
            .await?;
        self.keeper.set_fee_enabled(port_id, channel_id, true).await?;

        FeeMetadata::new(metadata.fee_version, &app_version).to_version()
    }

    async fn on_chan_open_ack(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        counterparty_version: &Version,
    ) -> RelayFeeResult<()> {
        if !self.fee_enabled(port_id, channel_id).await {
            return self
                .app
                .on_chan_open_ack(port_id, channel_id, counterparty_version)
                .await;
        }

        match FeeMetadata::parse(counterparty_version) {
            Some(metadata) => {
                self.expect_fee_version(&metadata)?;
                self.app
                    .on_chan_open_ack(port_id, channel_id, &metadata.app_version())
                    .await
            }
            None => {
                // Counterparty does not run the fee middleware
                self.app
                    .on_chan_open_ack(port_id, channel_id, counterparty_version)
                    .await?;
                self.keeper.set_fee_enabled(port_id, channel_id, false).await?;
                info!(
                    "Counterparty of {}/{} declined fees; channel opens without them",
                    port_id, channel_id
                );
                Ok(())
            }
        }
    }

    async fn on_chan_open_confirm(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.app.on_chan_open_confirm(port_id, channel_id).await
    }

    async fn on_chan_close_init(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.app.on_chan_close_init(port_id, channel_id).await?;
        self.refund_on_close(port_id, channel_id).await;
        Ok(())
    }

    async fn on_chan_close_confirm(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.app.on_chan_close_confirm(port_id, channel_id).await?;
        self.refund_on_close(port_id, channel_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannelKeeper;
    use crate::msgs::MsgPayPacketFee;
    use crate::types::Fee;
    use relayfee_core::{Amount, ChannelState, Coin, Denom, FeeConfig, Sequence, Timestamp};
    use relayfee_state::MemoryStateStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Application that succeeds unless told to fail acknowledgements
    #[derive(Default)]
    struct MockApp {
        fail_ack: AtomicBool,
    }

    #[async_trait]
    impl PacketModule for MockApp {
        async fn on_recv_packet(&self, _packet: &Packet, _relayer: &Address) -> Acknowledgement {
            Acknowledgement::success()
        }

        async fn on_acknowledgement_packet(
            &self,
            _packet: &Packet,
            acknowledgement: &Acknowledgement,
            _relayer: &Address,
        ) -> RelayFeeResult<()> {
            assert_eq!(acknowledgement, &Acknowledgement::success());
            if self.fail_ack.load(Ordering::SeqCst) {
                return Err(RelayFeeError::ApplicationError("refused".into()));
            }
            Ok(())
        }

        async fn on_timeout_packet(&self, _packet: &Packet, _relayer: &Address) -> RelayFeeResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChannelModule for MockApp {}

    type Middleware = FeeMiddleware<MockApp, MemoryStateStore, InMemoryChannelKeeper>;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn stake() -> Denom {
        Denom::new("stake").unwrap()
    }

    fn counterparty() -> Counterparty {
        Counterparty {
            port_id: PortId::transfer(),
            channel_id: Some(ChannelId::new(0)),
        }
    }

    fn fee_version() -> Version {
        FeeMetadata::new("ics29-1", &Version::ics20()).to_version().unwrap()
    }

    async fn setup() -> (Middleware, Arc<InMemoryChannelKeeper>, ChannelId) {
        let store = Arc::new(MemoryStateStore::new());
        let channels = Arc::new(InMemoryChannelKeeper::new());
        let keeper = Arc::new(
            FeeKeeper::new(store, channels.clone(), FeeConfig::default()).unwrap(),
        );
        let middleware = FeeMiddleware::new(MockApp::default(), keeper.clone());

        let channel_id = channels.create_channel(
            &PortId::transfer(),
            ChannelState::Open,
            Order::Unordered,
            counterparty(),
            fee_version(),
        );
        let version = middleware
            .on_chan_open_init(
                Order::Unordered,
                &PortId::transfer(),
                &channel_id,
                &counterparty(),
                &fee_version(),
            )
            .await
            .unwrap();
        assert_eq!(version, fee_version());

        let mut overlay = keeper.overlay();
        keeper
            .ledger
            .bank()
            .mint(&mut overlay, &addr("payer"), &Coin::new(stake(), Amount(1_000)))
            .await
            .unwrap();
        overlay.commit().await.unwrap();

        (middleware, channels, channel_id)
    }

    async fn send_with_fee(
        middleware: &Middleware,
        channels: &InMemoryChannelKeeper,
        channel_id: &ChannelId,
    ) -> Packet {
        let packet = channels
            .send_packet(&PortId::transfer(), channel_id, b"data".to_vec(), Timestamp(0))
            .unwrap();
        middleware.on_send_packet(&packet).await.unwrap();
        middleware
            .keeper()
            .pay_packet_fee(MsgPayPacketFee {
                packet_id: packet.source_id(),
                fee: Fee::new(stake(), Amount(50), Amount(25), Amount(10)),
                signer: addr("payer"),
                relayers: vec![],
            })
            .await
            .unwrap();
        packet
    }

    /// The acknowledgement a counterparty running the middleware would write
    fn incentivized_ack(forward: &str) -> Acknowledgement {
        IncentivizedAcknowledgement::wrap(&Acknowledgement::success(), &addr(forward))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_metadata_parsing() {
        let metadata = FeeMetadata::parse(&fee_version()).unwrap();
        assert_eq!(metadata.fee_version, "ics29-1");
        assert_eq!(metadata.app_version(), Version::ics20());
        assert!(FeeMetadata::parse(&Version::ics20()).is_none());
    }

    #[test]
    fn test_incentivized_ack_json() {
        let ack = IncentivizedAcknowledgement::wrap(&Acknowledgement::error("boom"), &addr("relayer1"));
        let decoded = IncentivizedAcknowledgement::decode(&ack.encode().unwrap()).unwrap();
        assert!(!decoded.underlying_app_success);
        assert_eq!(decoded.forward_relayer(), Some(addr("relayer1")));

        let json: serde_json::Value = serde_json::from_slice(ack.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(json["forward_relayer_address"], "relayer1");
        assert!(json["app_acknowledgement"].is_string());
    }

    #[tokio::test]
    async fn test_plain_version_opens_without_fees() {
        let (middleware, channels, _) = setup().await;
        let channel_id = channels.create_channel(
            &PortId::transfer(),
            ChannelState::Init,
            Order::Unordered,
            counterparty(),
            Version::ics20(),
        );

        let version = middleware
            .on_chan_open_init(
                Order::Unordered,
                &PortId::transfer(),
                &channel_id,
                &counterparty(),
                &Version::ics20(),
            )
            .await
            .unwrap();
        assert_eq!(version, Version::ics20());
        assert!(!middleware
            .keeper()
            .is_fee_enabled(&PortId::transfer(), &channel_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_wrong_fee_version_rejected() {
        let (middleware, _, channel_id) = setup().await;
        let version = FeeMetadata::new("ics29-9", &Version::ics20()).to_version().unwrap();

        let err = middleware
            .on_chan_open_try(Order::Unordered, &PortId::transfer(), &channel_id, &counterparty(), &version)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayFeeError::InvalidVersion(_)));
    }

    #[tokio::test]
    async fn test_ack_without_counterparty_fee_support_disables_fees() {
        let (middleware, _, channel_id) = setup().await;

        middleware
            .on_chan_open_ack(&PortId::transfer(), &channel_id, &Version::ics20())
            .await
            .unwrap();
        assert!(!middleware
            .keeper()
            .is_fee_enabled(&PortId::transfer(), &channel_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_recv_wraps_ack_with_counterparty_payee() {
        let (middleware, _, channel_id) = setup().await;
        middleware
            .keeper()
            .register_counterparty_payee(crate::msgs::MsgRegisterCounterpartyPayee {
                port_id: PortId::transfer(),
                channel_id: channel_id.clone(),
                relayer: addr("relayer1"),
                counterparty_payee: addr("payee1"),
            })
            .await
            .unwrap();

        let packet = Packet {
            sequence: Sequence(1),
            source_port: PortId::transfer(),
            source_channel: ChannelId::new(0),
            destination_port: PortId::transfer(),
            destination_channel: channel_id,
            data: vec![],
            timeout_timestamp: Timestamp(0),
        };
        let ack = middleware.on_recv_packet(&packet, &addr("relayer1")).await;

        let decoded = IncentivizedAcknowledgement::decode(&ack).unwrap();
        assert_eq!(decoded.forward_relayer(), Some(addr("payee1")));
        assert!(decoded.underlying_app_success);
        assert_eq!(decoded.app_acknowledgement(), Acknowledgement::success());
    }

    #[tokio::test]
    async fn test_ack_distributes_after_app() {
        let (middleware, channels, channel_id) = setup().await;
        let packet = send_with_fee(&middleware, &channels, &channel_id).await;

        middleware
            .on_acknowledgement_packet(&packet, &incentivized_ack("forward"), &addr("reverse"))
            .await
            .unwrap();

        let keeper = middleware.keeper();
        assert_eq!(keeper.balance(&addr("forward"), &stake()).await.unwrap(), Amount(50));
        assert_eq!(keeper.balance(&addr("reverse"), &stake()).await.unwrap(), Amount(25));
        assert_eq!(keeper.balance(&addr("payer"), &stake()).await.unwrap(), Amount(925));
    }

    #[tokio::test]
    async fn test_app_failure_keeps_fees_escrowed() {
        let (middleware, channels, channel_id) = setup().await;
        let packet = send_with_fee(&middleware, &channels, &channel_id).await;
        middleware.app().fail_ack.store(true, Ordering::SeqCst);

        let err = middleware
            .on_acknowledgement_packet(&packet, &incentivized_ack("forward"), &addr("reverse"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayFeeError::ApplicationError(_)));
        assert!(middleware
            .keeper()
            .incentivized_packet(&packet.source_id())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_distributes() {
        let (middleware, channels, channel_id) = setup().await;
        let packet = send_with_fee(&middleware, &channels, &channel_id).await;

        middleware
            .on_timeout_packet(&packet, &addr("relayer"))
            .await
            .unwrap();

        let keeper = middleware.keeper();
        assert_eq!(keeper.balance(&addr("relayer"), &stake()).await.unwrap(), Amount(10));
        assert_eq!(keeper.balance(&addr("payer"), &stake()).await.unwrap(), Amount(990));
    }

    #[tokio::test]
    async fn test_close_refunds() {
        let (middleware, channels, channel_id) = setup().await;
        send_with_fee(&middleware, &channels, &channel_id).await;

        middleware
            .on_chan_close_init(&PortId::transfer(), &channel_id)
            .await
            .unwrap();

        let keeper = middleware.keeper();
        assert_eq!(keeper.balance(&addr("payer"), &stake()).await.unwrap(), Amount(1_000));
        assert!(keeper
            .incentivized_packets(&PortId::transfer(), &channel_id)
            .await
            .unwrap()
            .is_empty());
    }
}
