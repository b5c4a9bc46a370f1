//! Packet and channel types exchanged with the base packet-relay channel

use crate::error::RelayFeeError;
use crate::types::{ChannelId, PacketId, PortId, Sequence, Timestamp};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serde adapter encoding raw bytes as base64 strings
pub mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A packet as committed by the sending channel end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub sequence: Sequence,
    pub source_port: PortId,
    pub source_channel: ChannelId,
    pub destination_port: PortId,
    pub destination_channel: ChannelId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Zero disables the timestamp timeout
    pub timeout_timestamp: Timestamp,
}

impl Packet {
    /// Identifier of the packet on the sending chain
    pub fn source_id(&self) -> PacketId {
        PacketId::new(
            self.source_port.clone(),
            self.source_channel.clone(),
            self.sequence,
        )
    }

    /// Identifier of the packet on the receiving chain
    pub fn destination_id(&self) -> PacketId {
        PacketId::new(
            self.destination_port.clone(),
            self.destination_channel.clone(),
            self.sequence,
        )
    }

    pub fn timed_out_at(&self, now: Timestamp) -> bool {
        !self.timeout_timestamp.is_zero() && now >= self.timeout_timestamp
    }
}

/// Standard application acknowledgement envelope: `{"result": ..}` or `{"error": ..}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppAcknowledgement {
    Result(String),
    Error(String),
}

/// Opaque acknowledgement bytes written by the receiving application
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl Acknowledgement {
    /// The success acknowledgement, `{"result":"AQ=="}`
    pub fn success() -> Self {
        Self::from_app(&AppAcknowledgement::Result(BASE64.encode([1u8])))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::from_app(&AppAcknowledgement::Error(message.into()))
    }

    fn from_app(ack: &AppAcknowledgement) -> Self {
        Acknowledgement(serde_json::to_vec(ack).unwrap_or_default())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Acknowledgement(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Non-standard payloads count as success; only an explicit error envelope fails
    pub fn is_success(&self) -> bool {
        !matches!(
            serde_json::from_slice::<AppAcknowledgement>(&self.0),
            Ok(AppAcknowledgement::Error(_))
        )
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Acknowledgement({s})"),
            Err(_) => write!(f, "Acknowledgement(0x{})", hex::encode(&self.0)),
        }
    }
}

/// Channel version string negotiated during the handshake
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub String);

impl Version {
    pub fn new(value: impl Into<String>) -> Self {
        Version(value.into())
    }

    pub fn ics20() -> Self {
        Version("ics20-1".to_string())
    }

    pub fn empty() -> Self {
        Version(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Unordered,
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Init,
    TryOpen,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub port_id: PortId,
    pub channel_id: Option<ChannelId>,
}

/// One end of a channel as stored by the base channel keeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnd {
    pub state: ChannelState,
    pub ordering: Order,
    pub counterparty: Counterparty,
    pub version: Version,
}

impl ChannelEnd {
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn ensure_open(&self, port_id: &PortId, channel_id: &ChannelId) -> Result<(), RelayFeeError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RelayFeeError::ChannelClosed {
                port_id: port_id.clone(),
                channel_id: channel_id.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledgement_success() {
        let ack = Acknowledgement::success();
        assert_eq!(ack.as_bytes(), br#"{"result":"AQ=="}"#);
        assert!(ack.is_success());
        assert!(!Acknowledgement::error("boom").is_success());
    }

    #[test]
    fn test_packet_timeout() {
        let packet = Packet {
            sequence: Sequence::new(1),
            source_port: PortId::transfer(),
            source_channel: ChannelId::new(0),
            destination_port: PortId::transfer(),
            destination_channel: ChannelId::new(1),
            data: b"{}".to_vec(),
            timeout_timestamp: Timestamp::from_millis(100),
        };

        assert!(!packet.timed_out_at(Timestamp::from_millis(99)));
        assert!(packet.timed_out_at(Timestamp::from_millis(100)));
        assert_eq!(packet.destination_id().channel_id, ChannelId::new(1));
    }

    #[test]
    fn test_packet_json_uses_base64_data() {
        let packet = Packet {
            sequence: Sequence::new(1),
            source_port: PortId::transfer(),
            source_channel: ChannelId::new(0),
            destination_port: PortId::transfer(),
            destination_channel: ChannelId::new(0),
            data: vec![1, 2, 3],
            timeout_timestamp: Timestamp::default(),
        };

        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["data"], "AQID");
    }
}
