//! Error types for the yield bridge
//!
//! Validation errors are rejected synchronously without touching state.
//! Duplicate deliveries are not errors: handlers report them as
//! [`Outcome::Duplicate`](crate::types::Outcome).

use thiserror::Error;

use crate::types::{Amount, DomainId, MessageId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    #[error("Invalid address: {reason}")]
    InvalidAddress { reason: String },

    #[error("Invalid message id: {reason}")]
    InvalidMessageId { reason: String },

    #[error("Unauthorized: {caller} may not perform this action")]
    Unauthorized { caller: String },

    #[error("Domain mismatch: expected {expected}, got {got}")]
    DomainMismatch { expected: DomainId, got: DomainId },

    #[error("Unexpected message kind: {got}")]
    UnexpectedMessageKind { got: String },

    #[error("Withdrawal not found: {id}")]
    WithdrawalNotFound { id: MessageId },

    #[error("Deposit not found: {id}")]
    DepositNotFound { id: MessageId },

    #[error("Withdrawal {id} is {status}, expected {expected}")]
    InvalidWithdrawalState {
        id: MessageId,
        status: String,
        expected: String,
    },

    // ========================================================================
    // Funds Errors
    // ========================================================================
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Amount, available: Amount },

    #[error("Insufficient liquidity: requested {requested}, liquidity {available}")]
    InsufficientLiquidity { requested: Amount, available: Amount },

    #[error("Withdrawal exceeds position: requested {requested}, position {available}")]
    ExceedsPosition { requested: Amount, available: Amount },

    #[error("Arithmetic overflow")]
    Overflow,

    // ========================================================================
    // Delivery Errors
    // ========================================================================
    #[error("Message delivery failed for {id}: {reason}")]
    MessageDeliveryFailure { id: MessageId, reason: String },

    // ========================================================================
    // Fatal Configuration Errors
    // ========================================================================
    #[error("Configuration mismatch: {field} expected {expected}, got {got}")]
    ConfigMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("Gateway halted: {reason}")]
    GatewayHalted { reason: String },

    // ========================================================================
    // Storage Errors
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),
}

/// Broad classes used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected synchronously, no state change
    Validation,
    /// Balance or liquidity shortfall, the operation is rejected
    Funds,
    /// Channel hand-off failed, retry with the same message id
    Delivery,
    /// Gateway must stop processing until configuration is corrected
    Fatal,
    /// Persistence or codec failure
    Storage,
}

impl BridgeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::InvalidAmount { .. }
            | BridgeError::InvalidAddress { .. }
            | BridgeError::InvalidMessageId { .. }
            | BridgeError::Unauthorized { .. }
            | BridgeError::DomainMismatch { .. }
            | BridgeError::UnexpectedMessageKind { .. }
            | BridgeError::WithdrawalNotFound { .. }
            | BridgeError::DepositNotFound { .. }
            | BridgeError::InvalidWithdrawalState { .. } => ErrorCategory::Validation,
            BridgeError::InsufficientFunds { .. }
            | BridgeError::InsufficientLiquidity { .. }
            | BridgeError::ExceedsPosition { .. }
            | BridgeError::Overflow => ErrorCategory::Funds,
            BridgeError::MessageDeliveryFailure { .. } => ErrorCategory::Delivery,
            BridgeError::ConfigMismatch { .. } | BridgeError::GatewayHalted { .. } => {
                ErrorCategory::Fatal
            }
            BridgeError::Storage(_) | BridgeError::Wire(_) => ErrorCategory::Storage,
        }
    }

    /// Whether the caller may retry the same operation (same message id)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Delivery | ErrorCategory::Storage
        ) && !matches!(self, BridgeError::Wire(_))
    }
}

/// Errors raised while decoding the binary message format
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Message truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown domain tag: {0}")]
    UnknownDomain(u8),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Invalid user field: {0}")]
    InvalidUser(String),

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),

    #[error("Message id {got} does not match content, expected {expected}")]
    IdMismatch { expected: MessageId, got: MessageId },
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
