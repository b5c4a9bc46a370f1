//! Core types for relayfee
//!
//! Defines fundamental data structures used across the system.

use crate::error::RelayFeeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account address on a chain.
///
/// Addresses are opaque strings to the fee module. They only need to be
/// well formed: 3 to 128 ASCII alphanumeric characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub const MIN_LEN: usize = 3;
    pub const MAX_LEN: usize = 128;

    pub fn new(value: impl Into<String>) -> Result<Self, RelayFeeError> {
        let value = value.into();
        if value.len() < Self::MIN_LEN || value.len() > Self::MAX_LEN {
            return Err(RelayFeeError::InvalidAddress(format!(
                "address length {} out of range [{}, {}]",
                value.len(),
                Self::MIN_LEN,
                Self::MAX_LEN
            )));
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RelayFeeError::InvalidAddress(format!(
                "address {value:?} contains invalid characters"
            )));
        }
        Ok(Address(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = RelayFeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

impl TryFrom<String> for Address {
    type Error = RelayFeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// Token amount in the smallest unit of its denomination
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(u128::MAX);

    pub fn new(value: u128) -> Self {
        Amount(value)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

/// Token denomination, e.g. `stake`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Denom(String);

impl Denom {
    pub fn new(value: impl Into<String>) -> Result<Self, RelayFeeError> {
        let value = value.into();
        let valid_chars = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '_' | '-'));
        let starts_alpha = value.chars().next().map_or(false, |c| c.is_ascii_alphabetic());
        if value.len() < 2 || value.len() > 128 || !valid_chars || !starts_alpha {
            return Err(RelayFeeError::InvalidFee(format!("invalid denomination {value:?}")));
        }
        Ok(Denom(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Denom {
    type Err = RelayFeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Denom::new(s)
    }
}

impl TryFrom<String> for Denom {
    type Error = RelayFeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Denom::new(value)
    }
}

impl From<Denom> for String {
    fn from(denom: Denom) -> Self {
        denom.0
    }
}

impl fmt::Display for Denom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Denom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Denom({})", self.0)
    }
}

/// An amount of a single denomination
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub denom: Denom,
    pub amount: Amount,
}

impl Coin {
    pub fn new(denom: Denom, amount: Amount) -> Self {
        Self { denom, amount }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

impl fmt::Debug for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coin({}{})", self.amount, self.denom)
    }
}

/// 32-byte hash type
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", self.to_hex())
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis() as u64)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// A zero timestamp means "no timestamp set"
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// State version, bumped on every committed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StateVersion(pub u64);

impl StateVersion {
    pub fn new(value: u64) -> Self {
        StateVersion(value)
    }

    pub fn next(&self) -> StateVersion {
        StateVersion(self.0 + 1)
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// State root hash
pub type StateRoot = Hash;

fn validate_identifier(id: &str, min: usize, max: usize) -> Result<(), RelayFeeError> {
    if id.len() < min || id.len() > max {
        return Err(RelayFeeError::InvalidIdentifier(format!(
            "identifier {id:?} has length {} outside [{min}, {max}]",
            id.len()
        )));
    }

    let valid = id.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '.' | '_' | '+' | '-' | '#' | '[' | ']' | '<' | '>')
    });

    if !valid {
        return Err(RelayFeeError::InvalidIdentifier(format!(
            "identifier {id:?} contains invalid characters"
        )));
    }

    Ok(())
}

/// Port identifier, e.g. `transfer`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortId(String);

impl PortId {
    pub fn new(value: impl Into<String>) -> Result<Self, RelayFeeError> {
        let value = value.into();
        validate_identifier(&value, 2, 128)?;
        Ok(PortId(value))
    }

    pub fn transfer() -> Self {
        PortId("transfer".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Channel identifier, e.g. `channel-0`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    const PREFIX: &'static str = "channel-";

    pub fn new(counter: u64) -> Self {
        ChannelId(format!("{}{}", Self::PREFIX, counter))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, RelayFeeError> {
        let value = value.into();
        validate_identifier(&value, 8, 64)?;
        Ok(ChannelId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_identifier_traits {
    ($ty:ident, $ctor:ident) => {
        impl FromStr for $ty {
            type Err = RelayFeeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::$ctor(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = RelayFeeError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                $ty::$ctor(value)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> Self {
                id.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.0)
            }
        }
    };
}

impl_identifier_traits!(PortId, new);
impl_identifier_traits!(ChannelId, parse);

/// Packet sequence number, assigned by the sending channel end
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl Sequence {
    pub fn new(value: u64) -> Self {
        Sequence(value)
    }

    pub fn next(&self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.0)
    }
}

impl FromStr for Sequence {
    type Err = RelayFeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Sequence)
            .map_err(|e| RelayFeeError::InvalidIdentifier(format!("invalid sequence {s:?}: {e}")))
    }
}

/// Uniquely identifies one packet sent on a channel end
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketId {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub sequence: Sequence,
}

impl PacketId {
    pub fn new(port_id: PortId, channel_id: ChannelId, sequence: Sequence) -> Self {
        Self {
            port_id,
            channel_id,
            sequence,
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.port_id, self.channel_id, self.sequence)
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({self})")
    }
}
