//! Common types shared by both gateways and the yield pool

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Integer minor-unit amount
pub type Amount = u128;

/// Minor units in one whole unit (6 decimals)
pub const UNIT: Amount = 1_000_000;

/// Basis-point denominator (10_000 bps = 100%)
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Maximum length of a domain-native address in bytes
pub const MAX_ADDRESS_LEN: usize = 64;

// ============================================================================
// Domain
// ============================================================================

/// One of the two transactional ledgers joined by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainId {
    Origin,
    Destination,
}

impl DomainId {
    /// Wire tag
    pub fn as_u8(&self) -> u8 {
        match self {
            DomainId::Origin => 1,
            DomainId::Destination => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DomainId::Origin),
            2 => Some(DomainId::Destination),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainId::Origin => "origin",
            DomainId::Destination => "destination",
        }
    }

    /// The domain on the other side of the channel
    pub fn peer(&self) -> Self {
        match self {
            DomainId::Origin => DomainId::Destination,
            DomainId::Destination => DomainId::Origin,
        }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Address
// ============================================================================

/// Domain-native account or gateway address
///
/// Opaque to the bridge beyond basic shape checks: non-empty, at most
/// [`MAX_ADDRESS_LEN`] bytes, no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Result<Self, BridgeError> {
        let value = value.into();
        if value.is_empty() {
            return Err(BridgeError::InvalidAddress {
                reason: "address cannot be empty".to_string(),
            });
        }
        if value.len() > MAX_ADDRESS_LEN {
            return Err(BridgeError::InvalidAddress {
                reason: format!("address longer than {} bytes", MAX_ADDRESS_LEN),
            });
        }
        if value.chars().any(char::is_whitespace) {
            return Err(BridgeError::InvalidAddress {
                reason: "address contains whitespace".to_string(),
            });
        }
        Ok(Address(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for Address {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl FromStr for Address {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Message ID
// ============================================================================

/// 32-byte message identifier, unique per channel
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    /// The all-zero id, used as "no reference"
    pub fn zero() -> Self {
        MessageId([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex with 0x prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(value: &str) -> Result<Self, BridgeError> {
        let stripped = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(stripped).map_err(|e| BridgeError::InvalidMessageId {
            reason: format!("invalid hex: {}", e),
        })?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| BridgeError::InvalidMessageId {
                reason: format!("expected 32 bytes, got {}", b.len()),
            })?;
        Ok(MessageId(array))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

impl FromStr for MessageId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageId::from_hex(s)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MessageId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// Per-user ledger entry, kept independently on each domain
///
/// Invariant: `locked_for_withdrawal <= principal + accrued_yield`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub principal: Amount,
    pub accrued_yield: Amount,
    pub locked_for_withdrawal: Amount,
    /// Cumulative deposits, never reduced
    pub total_deposited: Amount,
    /// Cumulative released withdrawals
    pub total_withdrawn: Amount,
    /// Highest destination sequence reflected in this view (origin side only)
    pub synced_sequence: u64,
}

impl UserAccount {
    /// Principal plus accrued yield
    pub fn balance(&self) -> Amount {
        self.principal.saturating_add(self.accrued_yield)
    }

    /// Balance not already locked by an in-flight withdrawal
    pub fn available(&self) -> Amount {
        self.balance().saturating_sub(self.locked_for_withdrawal)
    }

    pub fn is_consistent(&self) -> bool {
        self.locked_for_withdrawal <= self.balance()
    }
}

// ============================================================================
// Handler outcome
// ============================================================================

/// Why a destination-side request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientBalance,
    InsufficientLiquidity,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientBalance => write!(f, "insufficient_balance"),
            RejectReason::InsufficientLiquidity => write!(f, "insufficient_liquidity"),
        }
    }
}

/// Result of applying an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// State changed
    Applied,
    /// Message id recorded but the request was refused
    Rejected(RejectReason),
    /// Message id already processed, nothing changed
    Duplicate,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Rejected(_) => "rejected",
            Outcome::Duplicate => "duplicate",
        }
    }
}

/// Format minor units as a decimal string with 6 places
pub fn format_units(amount: Amount) -> String {
    format!("{}.{:06}", amount / UNIT, amount % UNIT)
}
