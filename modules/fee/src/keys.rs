//! State key layout of the bank and fee module
//!
//! Identifiers never contain `/`, so every key splits back into its parts.
//! Sequences are zero padded so that key order is sequence order.

use relayfee_core::{Address, ChannelId, Denom, PacketId, PortId, Sequence};
use std::str::FromStr;

pub const BANK_PREFIX: &str = "bank/";
pub const FEE_ENABLED_PREFIX: &str = "fee/enabled/";
pub const PAYEE_PREFIX: &str = "fee/payee/";
pub const COUNTERPARTY_PAYEE_PREFIX: &str = "fee/cpayee/";
pub const PACKET_FEES_PREFIX: &str = "fee/records/";
pub const QUEUED_FEES_PREFIX: &str = "fee/queued/";
pub const PACKET_STATUS_PREFIX: &str = "fee/status/";
pub const INDEX_PREFIX: &str = "fee/index/";
pub const FEE_LOCKED_KEY: &[u8] = b"fee/locked";

/// `bank/{address}/{denom}`; the denom goes last because it may contain `/`
pub fn balance_key(address: &Address, denom: &Denom) -> Vec<u8> {
    format!("{BANK_PREFIX}{address}/{denom}").into_bytes()
}

pub fn fee_enabled_key(port_id: &PortId, channel_id: &ChannelId) -> Vec<u8> {
    format!("{FEE_ENABLED_PREFIX}{port_id}/{channel_id}").into_bytes()
}

pub fn payee_key(channel_id: &ChannelId, relayer: &Address) -> Vec<u8> {
    format!("{PAYEE_PREFIX}{channel_id}/{relayer}").into_bytes()
}

pub fn counterparty_payee_key(channel_id: &ChannelId, relayer: &Address) -> Vec<u8> {
    format!("{COUNTERPARTY_PAYEE_PREFIX}{channel_id}/{relayer}").into_bytes()
}

fn packet_key(prefix: &str, packet_id: &PacketId) -> Vec<u8> {
    format!(
        "{prefix}{}/{}/{:020}",
        packet_id.port_id, packet_id.channel_id, packet_id.sequence.0
    )
    .into_bytes()
}

fn channel_prefix(prefix: &str, port_id: &PortId, channel_id: &ChannelId) -> Vec<u8> {
    format!("{prefix}{port_id}/{channel_id}/").into_bytes()
}

pub fn packet_fees_key(packet_id: &PacketId) -> Vec<u8> {
    packet_key(PACKET_FEES_PREFIX, packet_id)
}

pub fn queued_fees_key(packet_id: &PacketId) -> Vec<u8> {
    packet_key(QUEUED_FEES_PREFIX, packet_id)
}

pub fn packet_status_key(packet_id: &PacketId) -> Vec<u8> {
    packet_key(PACKET_STATUS_PREFIX, packet_id)
}

pub fn index_key(packet_id: &PacketId) -> Vec<u8> {
    packet_key(INDEX_PREFIX, packet_id)
}

pub fn index_channel_prefix(port_id: &PortId, channel_id: &ChannelId) -> Vec<u8> {
    channel_prefix(INDEX_PREFIX, port_id, channel_id)
}

pub fn queued_channel_prefix(port_id: &PortId, channel_id: &ChannelId) -> Vec<u8> {
    channel_prefix(QUEUED_FEES_PREFIX, port_id, channel_id)
}

pub fn packet_fees_channel_prefix(port_id: &PortId, channel_id: &ChannelId) -> Vec<u8> {
    channel_prefix(PACKET_FEES_PREFIX, port_id, channel_id)
}

fn split_key<'a>(prefix: &str, key: &'a [u8]) -> Option<Vec<&'a str>> {
    let rest = std::str::from_utf8(key).ok()?.strip_prefix(prefix)?;
    Some(rest.split('/').collect())
}

/// Inverse of the packet keyed layouts above
pub fn parse_packet_key(prefix: &str, key: &[u8]) -> Option<PacketId> {
    match split_key(prefix, key)?.as_slice() {
        [port, channel, sequence] => Some(PacketId::new(
            PortId::from_str(port).ok()?,
            ChannelId::from_str(channel).ok()?,
            Sequence::from_str(sequence).ok()?,
        )),
        _ => None,
    }
}

/// Inverse of [`payee_key`] and [`counterparty_payee_key`]
pub fn parse_payee_key(prefix: &str, key: &[u8]) -> Option<(ChannelId, Address)> {
    match split_key(prefix, key)?.as_slice() {
        [channel, relayer] => Some((
            ChannelId::from_str(channel).ok()?,
            Address::from_str(relayer).ok()?,
        )),
        _ => None,
    }
}

pub fn parse_fee_enabled_key(key: &[u8]) -> Option<(PortId, ChannelId)> {
    match split_key(FEE_ENABLED_PREFIX, key)?.as_slice() {
        [port, channel] => Some((PortId::from_str(port).ok()?, ChannelId::from_str(channel).ok()?)),
        _ => None,
    }
}

/// Inverse of [`balance_key`]
pub fn parse_balance_key(key: &[u8]) -> Option<(Address, Denom)> {
    let rest = std::str::from_utf8(key).ok()?.strip_prefix(BANK_PREFIX)?;
    let (address, denom) = rest.split_once('/')?;
    Some((Address::from_str(address).ok()?, Denom::from_str(denom).ok()?))
}
