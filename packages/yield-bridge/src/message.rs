//! Cross-domain message and its binary wire format
//!
//! Layout (big-endian, version 1):
//!
//! | offset  | size | field                          |
//! |---------|------|--------------------------------|
//! | 0       | 1    | version                        |
//! | 1       | 32   | id                             |
//! | 33      | 8    | nonce                          |
//! | 41      | 1    | source domain                  |
//! | 42      | 1    | destination domain             |
//! | 43      | 1    | kind                           |
//! | 44      | 32   | reference id                   |
//! | 76      | 1    | user length `L` (1..=64)       |
//! | 77      | L    | user (UTF-8)                   |
//! | 77+L    | 16   | amount                         |
//! | 93+L    | 16   | yield amount                   |
//! | 109+L   | 8    | timestamp (unix seconds)       |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WireError;
use crate::hash::compute_message_id;
use crate::types::{Address, Amount, DomainId, MessageId, MAX_ADDRESS_LEN};

pub const WIRE_VERSION: u8 = 1;

/// Encoded size without the variable-length user field
const FIXED_LEN: usize = 1 + 32 + 8 + 1 + 1 + 1 + 32 + 1 + 16 + 16 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Deposit,
    WithdrawRequest,
    WithdrawConfirm,
    WithdrawReject,
    DepositAck,
    YieldSync,
}

impl MessageKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            MessageKind::Deposit => 1,
            MessageKind::WithdrawRequest => 2,
            MessageKind::WithdrawConfirm => 3,
            MessageKind::WithdrawReject => 4,
            MessageKind::DepositAck => 5,
            MessageKind::YieldSync => 6,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::Deposit),
            2 => Some(MessageKind::WithdrawRequest),
            3 => Some(MessageKind::WithdrawConfirm),
            4 => Some(MessageKind::WithdrawReject),
            5 => Some(MessageKind::DepositAck),
            6 => Some(MessageKind::YieldSync),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Deposit => "deposit",
            MessageKind::WithdrawRequest => "withdraw_request",
            MessageKind::WithdrawConfirm => "withdraw_confirm",
            MessageKind::WithdrawReject => "withdraw_reject",
            MessageKind::DepositAck => "deposit_ack",
            MessageKind::YieldSync => "yield_sync",
        }
    }

    /// Kinds that answer an earlier message and carry its id in `reference`
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::WithdrawConfirm | MessageKind::WithdrawReject | MessageKind::DepositAck
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message crossing the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Emitting gateway's outbound counter
    pub nonce: u64,
    pub source_domain: DomainId,
    pub dest_domain: DomainId,
    pub kind: MessageKind,
    /// Id of the message this one answers; zero for originating messages
    pub reference: MessageId,
    pub user: Address,
    pub amount: Amount,
    /// Yield portion of a confirm, or the user's accrued yield in a sync
    pub yield_amount: Amount,
    pub timestamp: u64,
}

impl Message {
    /// Build a message and derive its id from content and nonce
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nonce: u64,
        source_domain: DomainId,
        dest_domain: DomainId,
        kind: MessageKind,
        reference: MessageId,
        user: Address,
        amount: Amount,
        yield_amount: Amount,
        timestamp: u64,
    ) -> Self {
        let id = compute_message_id(source_domain, dest_domain, kind, &user, amount, nonce);
        Self {
            id,
            nonce,
            source_domain,
            dest_domain,
            kind,
            reference,
            user,
            amount,
            yield_amount,
            timestamp,
        }
    }

    /// Encode into the version-1 wire layout
    pub fn encode(&self) -> Vec<u8> {
        let user = self.user.as_bytes();
        let mut out = Vec::with_capacity(FIXED_LEN + user.len());
        out.push(WIRE_VERSION);
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.push(self.source_domain.as_u8());
        out.push(self.dest_domain.as_u8());
        out.push(self.kind.as_u8());
        out.extend_from_slice(self.reference.as_bytes());
        // Address::new bounds the length to MAX_ADDRESS_LEN, so it fits a u8
        out.push(user.len() as u8);
        out.extend_from_slice(user);
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.yield_amount.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Decode a version-1 wire message
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);

        let version = reader.u8()?;
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let id = MessageId(reader.array::<32>()?);
        let nonce = u64::from_be_bytes(reader.array::<8>()?);
        let source_tag = reader.u8()?;
        let source_domain =
            DomainId::from_u8(source_tag).ok_or(WireError::UnknownDomain(source_tag))?;
        let dest_tag = reader.u8()?;
        let dest_domain = DomainId::from_u8(dest_tag).ok_or(WireError::UnknownDomain(dest_tag))?;
        let kind_tag = reader.u8()?;
        let kind = MessageKind::from_u8(kind_tag).ok_or(WireError::UnknownKind(kind_tag))?;
        let reference = MessageId(reader.array::<32>()?);

        let user_len = reader.u8()? as usize;
        if user_len == 0 || user_len > MAX_ADDRESS_LEN {
            return Err(WireError::InvalidUser(format!("length {}", user_len)));
        }
        let user_bytes = reader.take(user_len)?;
        let user_str = std::str::from_utf8(user_bytes)
            .map_err(|e| WireError::InvalidUser(e.to_string()))?;
        let user = Address::new(user_str).map_err(|e| WireError::InvalidUser(e.to_string()))?;

        let amount = u128::from_be_bytes(reader.array::<16>()?);
        let yield_amount = u128::from_be_bytes(reader.array::<16>()?);
        let timestamp = u64::from_be_bytes(reader.array::<8>()?);

        let remaining = reader.remaining();
        if remaining != 0 {
            return Err(WireError::TrailingBytes(remaining));
        }

        let expected = compute_message_id(source_domain, dest_domain, kind, &user, amount, nonce);
        if id != expected {
            return Err(WireError::IdMismatch { expected, got: id });
        }

        Ok(Self {
            id,
            nonce,
            source_domain,
            dest_domain,
            kind,
            reference,
            user,
            amount,
            yield_amount,
            timestamp,
        })
    }
}

struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(WireError::Truncated {
                needed: end,
                got: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}
