//! Yield Bridge: cross-domain deposit and yield ledger
//!
//! This crate provides the core state machines of the bridge:
//!
//! - **Sender** - origin-side gateway: escrow, deposits, withdrawal requests
//! - **Receiver** - destination-side gateway: applies deposits exactly once,
//!   services withdrawals from the yield pool, replies across the channel
//! - **Yield Pool** - principal positions, whole-period simple interest, liquidity
//! - **Message** - cross-domain message, binary wire codec, keccak256 message ids
//! - **Channel** - at-least-once transport abstraction (`QueueChannel`, `MpscChannel`)
//! - **Store** - JSON snapshot persistence (`MemoryStore`, `FileStore`)
//! - **Retry** - backoff policy for channel hand-offs
//!
//! Every ledger operation takes the current unix time explicitly, so replaying
//! the same inputs always produces the same state.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! yield-bridge = { path = "../yield-bridge" }
//! ```

pub mod channel;
pub mod error;
pub mod hash;
pub mod message;
pub mod pool;
pub mod processed;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod store;
pub mod types;

// Re-export commonly used items at the crate root
pub use channel::{ChannelError, Envelope, MessageChannel, MpscChannel, QueueChannel};
pub use error::{BridgeError, ErrorCategory, Result, WireError};
pub use hash::{compute_message_id, keccak256};
pub use message::{Message, MessageKind, WIRE_VERSION};
pub use pool::{
    PoolConfig, PoolState, PoolStats, Position, Withdrawal, YieldPool,
    DEFAULT_ACCRUAL_PERIOD_SECS, DEFAULT_YIELD_RATE_BPS,
};
pub use processed::ProcessedMessageSet;
pub use receiver::{
    InboundRecord, InboundState, Receiver, ReceiverConfig, ReceiverSnapshot,
    RECEIVER_SNAPSHOT_KEY,
};
pub use retry::{classify_error, with_retry, ErrorClass, RetryAction, RetryContext, RetryPolicy};
pub use sender::{
    DepositRecord, EscrowAccount, PendingWithdrawal, Sender, SenderConfig, SenderSnapshot,
    WithdrawalStatus, DEFAULT_WITHDRAW_TIMEOUT_SECS, SENDER_SNAPSHOT_KEY,
};
pub use store::{load_json, save_json, FileStore, MemoryStore, SnapshotStore};
pub use types::{
    format_units, Address, Amount, DomainId, MessageId, Outcome, RejectReason, UserAccount,
    BPS_DENOMINATOR, UNIT,
};
