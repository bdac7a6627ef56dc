//! Core ledger types: identifiers, addresses, income segments.
//!
//! Timestamps are Unix seconds (UTC). Amounts are base units of the
//! distributed token and use `u128` so per-period prices with 18 decimals
//! multiply by resource counts without overflow.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Token amount in base units.
pub type Amount = u128;

/// Numeric identifier of a reward recipient.
pub type RecipientId = u64;

/// A 32-byte payment source identifier.
///
/// Derived from the source label with SHA-256 so that the same label always
/// maps to the same source.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(pub [u8; 32]);

impl SourceId {
    /// Derive the identifier of a source from its label.
    ///
    /// # Examples
    ///
    /// ```
    /// use paymaster_core::types::SourceId;
    /// assert_eq!(SourceId::from_label("d2-schain"), SourceId::from_label("d2-schain"));
    /// assert_ne!(SourceId::from_label("a"), SourceId::from_label("b"));
    /// ```
    pub fn from_label(label: &str) -> Self {
        let digest = Sha256::digest(label.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for SourceId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_prefixed_hex::<32>(s)?))
    }
}

impl TryFrom<String> for SourceId {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.to_string()
    }
}

/// A 20-byte account address (payers and payout targets).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The zero address.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Deterministic address filled with one byte; handy for fixtures.
    pub fn repeat(byte: u8) -> Self {
        Self([byte; 20])
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Check if this is the zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parse a `0x`-prefixed, 40 hex digit address.
    ///
    /// # Examples
    ///
    /// ```
    /// use paymaster_core::types::Address;
    /// let a: Address = "0x0101010101010101010101010101010101010101".parse().unwrap();
    /// assert_eq!(a, Address::repeat(1));
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_prefixed_hex::<20>(s)?))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

fn parse_prefixed_hex<const N: usize>(s: &str) -> Result<[u8; N], AddressError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or(AddressError::MissingPrefix)?;
    if digits.len() != N * 2 {
        return Err(AddressError::InvalidLength(digits.len()));
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(digits, &mut out).map_err(|e| AddressError::InvalidHex(e.to_string()))?;
    Ok(out)
}

/// A uniform income stream: `value` spread over `[from, to)`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncomeSegment {
    /// Inclusive start.
    pub from: Timestamp,
    /// Exclusive end, always greater than `from`.
    pub to: Timestamp,
    /// Total value carried by the segment.
    pub value: Amount,
}

impl IncomeSegment {
    /// Length of the segment in seconds.
    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    /// Whether the segment covers no time.
    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }
}

/// Serde adapter writing an [`Amount`] as a decimal string.
///
/// JSON numbers above 2^64 do not survive self-describing formats and
/// buffered (tagged or flattened) deserialization, so amounts travel as
/// strings. Plain numbers that fit in a `u64` are accepted on input.
///
/// ```
/// use paymaster_core::types::{decimal, Amount};
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Fee {
///     #[serde(with = "decimal")]
///     amount: Amount,
/// }
/// let json = serde_json::to_string(&Fee { amount: 5_000_000_000_000_000_000_000 }).unwrap();
/// assert_eq!(json, r#"{"amount":"5000000000000000000000"}"#);
/// ```
pub mod decimal {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Amount;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text
                .trim()
                .parse()
                .map_err(|e| D::Error::custom(format!("invalid amount {text:?}: {e}"))),
            Repr::Number(n) => Ok(Amount::from(n)),
        }
    }
}

/// Administrative operations gated by an [`Authority`](crate::traits::Authority).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    RegisterSource,
    RemoveSource,
    RegisterRecipient,
    RemoveRecipient,
    SetResourceCount,
    ClaimFor,
    ClearHistory,
    Configure,
    SetPrice,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegisterSource => "register a payment source",
            Self::RemoveSource => "remove a payment source",
            Self::RegisterRecipient => "register a recipient",
            Self::RemoveRecipient => "remove a recipient",
            Self::SetResourceCount => "change resource counts",
            Self::ClaimFor => "claim on behalf of a recipient",
            Self::ClearHistory => "clear history",
            Self::Configure => "change configuration",
            Self::SetPrice => "set the unit price",
        };
        f.write_str(name)
    }
}
