//! Processed message tracking
//!
//! Each gateway records the id of every inbound message it has applied or
//! rejected. The set only grows; a hit means the delivery is a replay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::MessageId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessageSet {
    ids: BTreeSet<MessageId>,
}

impl ProcessedMessageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Record an id. Returns false if it was already present.
    pub fn mark(&mut self, id: MessageId) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
