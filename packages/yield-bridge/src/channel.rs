//! Message channel abstraction
//!
//! The transport between the domains is external. Gateways only need to hand
//! an [`Envelope`] over and learn whether the hand-off was accepted; delivery
//! itself is at-least-once and unordered across message ids.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::types::Address;

/// A message together with the authenticated address of the gateway that sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: Address,
    pub message: Message,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Send rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Hand a message to the transport. `Ok` means accepted for delivery.
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelError>;
}

// ============================================================================
// In-memory queue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<Envelope>,
    fail_next: usize,
    sent: u64,
}

/// In-process channel that queues envelopes for the caller to deliver
///
/// Used by tests and simulations. Delivery is explicit: the caller drains the
/// queue and feeds each envelope to the peer gateway, which makes duplicate
/// and out-of-order delivery easy to reproduce.
#[derive(Default)]
pub struct QueueChannel {
    inner: Mutex<QueueInner>,
}

impl QueueChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail synchronously
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Take every queued envelope
    pub fn drain(&self) -> Vec<Envelope> {
        self.lock().queue.drain(..).collect()
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.lock().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of accepted sends since creation
    pub fn sent_count(&self) -> u64 {
        self.lock().sent
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // A poisoned queue only means a panicking test thread; keep the data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageChannel for QueueChannel {
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(ChannelError::Rejected("injected failure".to_string()));
        }
        inner.sent += 1;
        inner.queue.push_back(envelope);
        Ok(())
    }
}

// ============================================================================
// Tokio mpsc
// ============================================================================

/// Channel backed by a tokio unbounded mpsc sender
#[derive(Clone)]
pub struct MpscChannel {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MpscChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageChannel for MpscChannel {
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.tx.send(envelope).map_err(|_| ChannelError::Closed)
    }
}
