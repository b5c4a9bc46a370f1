//! Channel message handler
//!
//! Runs the base channel state transitions of the in-memory channel keeper
//! together with the callbacks of the module bound to the port. A module
//! error aborts the step: handshake and close transitions are not applied,
//! and a rejected send gives back its commitment and sequence. A channel
//! created by a rejected open init or try stays in its first state.

use relayfee_core::{
    Acknowledgement, Address, ChannelId, ChannelModule, ChannelState, Counterparty, Order, Packet,
    PacketModule, PortId, RelayFeeError, RelayFeeResult, Timestamp, Version,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::channel::InMemoryChannelKeeper;

pub struct ChannelHandler<M> {
    channels: Arc<InMemoryChannelKeeper>,
    module: M,
}

impl<M: PacketModule + ChannelModule> ChannelHandler<M> {
    pub fn new(channels: Arc<InMemoryChannelKeeper>, module: M) -> Self {
        Self { channels, module }
    }

    pub fn channels(&self) -> &Arc<InMemoryChannelKeeper> {
        &self.channels
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    // ============ Handshake ============

    /// Start a handshake. Returns the new channel and the version the module settled on.
    pub async fn chan_open_init(
        &self,
        port_id: &PortId,
        order: Order,
        counterparty_port: PortId,
        version: Version,
    ) -> RelayFeeResult<(ChannelId, Version)> {
        let counterparty = Counterparty {
            port_id: counterparty_port,
            channel_id: None,
        };
        let channel_id =
            self.channels
                .create_channel(port_id, ChannelState::Init, order, counterparty.clone(), version.clone());

        let version = self
            .module
            .on_chan_open_init(order, port_id, &channel_id, &counterparty, &version)
            .await?;
        self.channels.update_channel(port_id, &channel_id, |end| {
            end.version = version.clone();
        })?;

        info!("Channel {}/{} initialized with version {}", port_id, channel_id, version.as_str());
        Ok((channel_id, version))
    }

    pub async fn chan_open_try(
        &self,
        port_id: &PortId,
        order: Order,
        counterparty: Counterparty,
        counterparty_version: Version,
    ) -> RelayFeeResult<(ChannelId, Version)> {
        if counterparty.channel_id.is_none() {
            return Err(RelayFeeError::InvalidIdentifier(
                "open try requires the counterparty channel".into(),
            ));
        }
        let channel_id = self.channels.create_channel(
            port_id,
            ChannelState::TryOpen,
            order,
            counterparty.clone(),
            counterparty_version.clone(),
        );

        let version = self
            .module
            .on_chan_open_try(order, port_id, &channel_id, &counterparty, &counterparty_version)
            .await?;
        self.channels.update_channel(port_id, &channel_id, |end| {
            end.version = version.clone();
        })?;

        info!("Channel {}/{} in try-open with version {}", port_id, channel_id, version.as_str());
        Ok((channel_id, version))
    }

    pub async fn chan_open_ack(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        counterparty_channel_id: ChannelId,
        counterparty_version: Version,
    ) -> RelayFeeResult<()> {
        self.expect_state(port_id, channel_id, ChannelState::Init).await?;
        self.module
            .on_chan_open_ack(port_id, channel_id, &counterparty_version)
            .await?;

        self.channels.update_channel(port_id, channel_id, |end| {
            end.state = ChannelState::Open;
            end.counterparty.channel_id = Some(counterparty_channel_id);
            end.version = counterparty_version;
        })?;
        info!("Channel {}/{} open", port_id, channel_id);
        Ok(())
    }

    pub async fn chan_open_confirm(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.expect_state(port_id, channel_id, ChannelState::TryOpen).await?;
        self.module.on_chan_open_confirm(port_id, channel_id).await?;

        self.channels.update_channel(port_id, channel_id, |end| {
            end.state = ChannelState::Open;
        })?;
        info!("Channel {}/{} open", port_id, channel_id);
        Ok(())
    }

    pub async fn chan_close_init(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.expect_not_closed(port_id, channel_id).await?;
        self.module.on_chan_close_init(port_id, channel_id).await?;
        self.close(port_id, channel_id)
    }

    pub async fn chan_close_confirm(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.expect_not_closed(port_id, channel_id).await?;
        self.module.on_chan_close_confirm(port_id, channel_id).await?;
        self.close(port_id, channel_id)
    }

    fn close(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        self.channels.update_channel(port_id, channel_id, |end| {
            end.state = ChannelState::Closed;
        })?;
        info!("Channel {}/{} closed", port_id, channel_id);
        Ok(())
    }

    async fn expect_state(&self, port_id: &PortId, channel_id: &ChannelId, expected: ChannelState) -> RelayFeeResult<()> {
        let channel = self.channel(port_id, channel_id).await?;
        if channel.state != expected {
            return Err(RelayFeeError::InvalidIdentifier(format!(
                "channel {port_id}/{channel_id} is {:?}, expected {:?}",
                channel.state, expected
            )));
        }
        Ok(())
    }

    async fn expect_not_closed(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<()> {
        if self.channel(port_id, channel_id).await?.state == ChannelState::Closed {
            return Err(RelayFeeError::ChannelClosed {
                port_id: port_id.clone(),
                channel_id: channel_id.clone(),
            });
        }
        Ok(())
    }

    async fn channel(&self, port_id: &PortId, channel_id: &ChannelId) -> RelayFeeResult<relayfee_core::ChannelEnd> {
        relayfee_core::ChannelKeeper::channel(self.channels.as_ref(), port_id, channel_id)
            .await
            .ok_or_else(|| RelayFeeError::ChannelNotFound {
                port_id: port_id.clone(),
                channel_id: channel_id.clone(),
            })
    }

    // ============ Packets ============

    pub async fn send_packet(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        data: Vec<u8>,
        timeout_timestamp: Timestamp,
    ) -> RelayFeeResult<Packet> {
        let packet = self
            .channels
            .send_packet(port_id, channel_id, data, timeout_timestamp)?;
        if let Err(e) = self.module.on_send_packet(&packet).await {
            self.channels.abort_send(&packet);
            return Err(e);
        }
        Ok(packet)
    }

    /// Deliver a packet on its destination chain and write the acknowledgement
    pub async fn recv_packet(&self, packet: &Packet, relayer: &Address, now: Timestamp) -> RelayFeeResult<Acknowledgement> {
        self.channels.recv_packet(packet, now)?;
        let ack = self.module.on_recv_packet(packet, relayer).await;
        self.channels.write_acknowledgement(packet, ack.clone());

        debug!("Received {} relayed by {}", packet.destination_id(), relayer);
        Ok(ack)
    }

    pub async fn acknowledge_packet(
        &self,
        packet: &Packet,
        acknowledgement: &Acknowledgement,
        relayer: &Address,
    ) -> RelayFeeResult<()> {
        self.channels.ensure_commitment(packet)?;
        self.module
            .on_acknowledgement_packet(packet, acknowledgement, relayer)
            .await?;
        self.channels.delete_commitment(&packet.source_id());

        debug!("Acknowledged {} relayed by {}", packet.source_id(), relayer);
        Ok(())
    }

    pub async fn timeout_packet(&self, packet: &Packet, relayer: &Address, now: Timestamp) -> RelayFeeResult<()> {
        self.channels.ensure_timed_out(packet, now)?;
        self.module.on_timeout_packet(packet, relayer).await?;
        self.channels.delete_commitment(&packet.source_id());

        debug!("Timed out {} relayed by {}", packet.source_id(), relayer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relayfee_core::Sequence;

    struct EchoApp;

    #[async_trait]
    impl PacketModule for EchoApp {
        async fn on_send_packet(&self, packet: &Packet) -> RelayFeeResult<()> {
            if packet.data == b"reject" {
                return Err(RelayFeeError::Internal("rejected by app".into()));
            }
            Ok(())
        }

        async fn on_recv_packet(&self, packet: &Packet, _relayer: &Address) -> Acknowledgement {
            if packet.data.is_empty() {
                Acknowledgement::error("empty packet")
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
    impl ChannelModule for EchoApp {}

    fn relayer() -> Address {
        Address::new("relayer1").unwrap()
    }

    /// Two handlers whose transfer channels are connected to each other
    async fn connected() -> (ChannelHandler<EchoApp>, ChannelHandler<EchoApp>, ChannelId, ChannelId) {
        let a = ChannelHandler::new(Arc::new(InMemoryChannelKeeper::new()), EchoApp);
        let b = ChannelHandler::new(Arc::new(InMemoryChannelKeeper::new()), EchoApp);
        let port = PortId::transfer();

        let (chan_a, version) = a
            .chan_open_init(&port, Order::Unordered, port.clone(), Version::ics20())
            .await
            .unwrap();
        let (chan_b, version) = b
            .chan_open_try(
                &port,
                Order::Unordered,
                Counterparty {
                    port_id: port.clone(),
                    channel_id: Some(chan_a.clone()),
                },
                version,
            )
            .await
            .unwrap();
        a.chan_open_ack(&port, &chan_a, chan_b.clone(), version).await.unwrap();
        b.chan_open_confirm(&port, &chan_b).await.unwrap();

        (a, b, chan_a, chan_b)
    }

    #[tokio::test]
    async fn test_packet_round_trip() {
        let (a, b, chan_a, _) = connected().await;
        let port = PortId::transfer();

        let packet = a
            .send_packet(&port, &chan_a, b"hello".to_vec(), Timestamp(0))
            .await
            .unwrap();
        let ack = b.recv_packet(&packet, &relayer(), Timestamp::now()).await.unwrap();
        assert!(ack.is_success());
        assert_eq!(b.channels().acknowledgement(&packet.destination_id()), Some(ack.clone()));

        a.acknowledge_packet(&packet, &ack, &relayer()).await.unwrap();
        assert!(a.channels().packet_commitment(&packet.source_id()).is_none());
        assert!(matches!(
            a.acknowledge_packet(&packet, &ack, &relayer()).await,
            Err(RelayFeeError::PacketCommitmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_and_close() {
        let (a, _, chan_a, _) = connected().await;
        let port = PortId::transfer();

        let packet = a
            .send_packet(&port, &chan_a, b"late".to_vec(), Timestamp(10))
            .await
            .unwrap();
        a.timeout_packet(&packet, &relayer(), Timestamp(11)).await.unwrap();

        a.chan_close_init(&port, &chan_a).await.unwrap();
        assert!(matches!(
            a.chan_close_init(&port, &chan_a).await,
            Err(RelayFeeError::ChannelClosed { .. })
        ));
        assert!(a.send_packet(&port, &chan_a, vec![1], Timestamp(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_send_leaves_no_commitment() {
        let (a, _, chan_a, _) = connected().await;
        let port = PortId::transfer();

        assert!(a
            .send_packet(&port, &chan_a, b"reject".to_vec(), Timestamp(0))
            .await
            .is_err());
        assert!(a.channels().pending_packets(&port, &chan_a).is_empty());

        // The rejected sequence is reused by the next packet
        let packet = a
            .send_packet(&port, &chan_a, b"hello".to_vec(), Timestamp(0))
            .await
            .unwrap();
        assert_eq!(packet.sequence, Sequence(1));
    }

    #[tokio::test]
    async fn test_ack_requires_init_state() {
        let (a, _, chan_a, chan_b) = connected().await;
        assert!(a
            .chan_open_ack(&PortId::transfer(), &chan_a, chan_b, Version::ics20())
            .await
            .is_err());
    }
}
