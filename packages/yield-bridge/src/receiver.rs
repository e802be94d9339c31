//! Destination-side gateway
//!
//! Applies inbound Deposit and WithdrawRequest messages exactly once, routes
//! funds through the [`YieldPool`], and answers every request with a single
//! reply (DepositAck, WithdrawConfirm or WithdrawReject). Replies are stored
//! with the inbound record so redeliveries re-send the same message id.
//!
//! Per-message lifecycle: received, then applied or rejected, then acked once
//! the reply has been handed to the channel. Replies whose send failed stay in
//! the outbox until [`Receiver::flush_outbox`] gets them through.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::channel::{Envelope, MessageChannel};
use crate::error::{BridgeError, Result};
use crate::message::{Message, MessageKind};
use crate::pool::{PoolStats, YieldPool};
use crate::processed::ProcessedMessageSet;
use crate::store::{load_json, save_json, SnapshotStore};
use crate::types::{Address, Amount, DomainId, MessageId, Outcome, RejectReason, UserAccount};

/// Snapshot key used by [`Receiver::persist`]
pub const RECEIVER_SNAPSHOT_KEY: &str = "receiver";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// This gateway's own address, stamped as envelope origin on replies
    pub address: Address,
    pub owner: Address,
    pub domain: DomainId,
    pub origin_domain: DomainId,
    /// The only sender gateway whose messages are accepted
    pub sender_address: Address,
    /// Address of the pool this gateway must be wired to
    pub lending_pool: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundState {
    Applied,
    Rejected,
    Acked,
}

/// What the receiver did with one inbound message, and its reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRecord {
    pub kind: MessageKind,
    pub outcome: Outcome,
    pub acked: bool,
    pub reply: Message,
}

impl InboundRecord {
    pub fn state(&self) -> InboundState {
        match (self.acked, self.outcome) {
            (true, _) => InboundState::Acked,
            (false, Outcome::Rejected(_)) => InboundState::Rejected,
            (false, _) => InboundState::Applied,
        }
    }
}

/// Everything the receiver needs to resume after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSnapshot {
    pub config: ReceiverConfig,
    pub pool: YieldPool,
    pub accounts: BTreeMap<Address, UserAccount>,
    pub processed: ProcessedMessageSet,
    pub inbound: BTreeMap<MessageId, InboundRecord>,
    pub outbound_nonce: u64,
    /// Accrued yield last reported to the origin, per user
    pub synced_yield: BTreeMap<Address, Amount>,
}

pub struct Receiver {
    config: ReceiverConfig,
    pool: YieldPool,
    accounts: BTreeMap<Address, UserAccount>,
    processed: ProcessedMessageSet,
    inbound: BTreeMap<MessageId, InboundRecord>,
    outbound_nonce: u64,
    synced_yield: BTreeMap<Address, Amount>,
    channel: Arc<dyn MessageChannel>,
    store: Option<Arc<dyn SnapshotStore>>,
    halted: Option<String>,
}

impl Receiver {
    /// Create a receiver wired to `pool`
    ///
    /// A configuration that does not match the pool leaves the receiver
    /// halted; check [`Receiver::halt_reason`] or call
    /// [`Receiver::reconfigure`] with a corrected config.
    pub fn new(config: ReceiverConfig, pool: YieldPool, channel: Arc<dyn MessageChannel>) -> Self {
        let mut receiver = Self {
            config,
            pool,
            accounts: BTreeMap::new(),
            processed: ProcessedMessageSet::new(),
            inbound: BTreeMap::new(),
            outbound_nonce: 0,
            synced_yield: BTreeMap::new(),
            channel,
            store: None,
            halted: None,
        };
        if let Err(e) = receiver.validate_config() {
            receiver.halt(e.to_string());
        }
        receiver
    }

    /// Rebuild a receiver from a snapshot, re-validating its configuration
    pub fn restore(snapshot: ReceiverSnapshot, channel: Arc<dyn MessageChannel>) -> Self {
        let mut receiver = Self {
            config: snapshot.config,
            pool: snapshot.pool,
            accounts: snapshot.accounts,
            processed: snapshot.processed,
            inbound: snapshot.inbound,
            outbound_nonce: snapshot.outbound_nonce,
            synced_yield: snapshot.synced_yield,
            channel,
            store: None,
            halted: None,
        };
        if let Err(e) = receiver.validate_config() {
            receiver.halt(e.to_string());
        }
        info!(
            processed = receiver.processed.len(),
            unacked = receiver.pending_replies(),
            "Receiver restored from snapshot"
        );
        receiver
    }

    /// Load the last persisted snapshot from `store`, if any
    pub fn load(
        store: Arc<dyn SnapshotStore>,
        channel: Arc<dyn MessageChannel>,
    ) -> Result<Option<Self>> {
        let snapshot: Option<ReceiverSnapshot> = load_json(store.as_ref(), RECEIVER_SNAPSHOT_KEY)?;
        Ok(snapshot.map(|s| Self::restore(s, channel).with_store(store)))
    }

    /// Persist state to `store` at every commit point
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn validate_config(&self) -> Result<()> {
        if self.config.domain == self.config.origin_domain {
            return Err(BridgeError::ConfigMismatch {
                field: "origin_domain".to_string(),
                expected: self.config.domain.peer().to_string(),
                got: self.config.origin_domain.to_string(),
            });
        }
        if &self.config.lending_pool != self.pool.address() {
            return Err(BridgeError::ConfigMismatch {
                field: "lending_pool".to_string(),
                expected: self.config.lending_pool.to_string(),
                got: self.pool.address().to_string(),
            });
        }
        Ok(())
    }

    fn halt(&mut self, reason: String) {
        error!(reason = %reason, "Receiver halted");
        self.halted = Some(reason);
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(BridgeError::GatewayHalted {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Confirm the paired sender points back at this receiver
    ///
    /// Halts the receiver on mismatch.
    pub fn verify_peer(
        &mut self,
        sender_address: &Address,
        sender_receiver_contract: &Address,
    ) -> Result<()> {
        let result = if sender_address != &self.config.sender_address {
            Err(BridgeError::ConfigMismatch {
                field: "sender_address".to_string(),
                expected: self.config.sender_address.to_string(),
                got: sender_address.to_string(),
            })
        } else if sender_receiver_contract != &self.config.address {
            Err(BridgeError::ConfigMismatch {
                field: "receiver_contract".to_string(),
                expected: self.config.address.to_string(),
                got: sender_receiver_contract.to_string(),
            })
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            self.halt(e.to_string());
        }
        result
    }

    /// Replace the configuration and lift the halt if it now validates
    pub fn reconfigure(&mut self, config: ReceiverConfig) -> Result<()> {
        let previous = std::mem::replace(&mut self.config, config);
        if let Err(e) = self.validate_config() {
            self.config = previous;
            return Err(e);
        }
        if self.halted.take().is_some() {
            info!("Receiver configuration corrected, resuming");
        }
        self.persist()
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    /// Apply one delivered message
    pub async fn handle(&mut self, envelope: Envelope, now: u64) -> Result<Outcome> {
        self.ensure_running()?;
        self.validate_inbound(&envelope)?;

        let message = envelope.message;
        if self.processed.contains(&message.id) {
            return Ok(self.redeliver(&message.id).await);
        }

        let outcome = match message.kind {
            MessageKind::Deposit => self.apply_deposit(&message, now)?,
            MessageKind::WithdrawRequest => self.apply_withdraw_request(&message, now)?,
            other => {
                return Err(BridgeError::UnexpectedMessageKind {
                    got: other.to_string(),
                })
            }
        };

        self.persist()?;
        if self.send_reply(&message.id).await {
            self.persist()?;
        }
        Ok(outcome)
    }

    fn validate_inbound(&self, envelope: &Envelope) -> Result<()> {
        if envelope.origin != self.config.sender_address {
            return Err(BridgeError::Unauthorized {
                caller: envelope.origin.to_string(),
            });
        }
        let message = &envelope.message;
        if message.source_domain != self.config.origin_domain {
            return Err(BridgeError::DomainMismatch {
                expected: self.config.origin_domain,
                got: message.source_domain,
            });
        }
        if message.dest_domain != self.config.domain {
            return Err(BridgeError::DomainMismatch {
                expected: self.config.domain,
                got: message.dest_domain,
            });
        }
        if message.amount == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "message amount must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Re-send the stored reply for an already processed message
    async fn redeliver(&mut self, id: &MessageId) -> Outcome {
        debug!(message_id = %id, "Duplicate delivery, re-sending stored reply");
        if self.send_reply(id).await {
            if let Err(e) = self.persist() {
                warn!(message_id = %id, error = %e, "Failed to persist ack state");
            }
        }
        Outcome::Duplicate
    }

    fn apply_deposit(&mut self, message: &Message, now: u64) -> Result<Outcome> {
        self.pool.deposit(&message.user, message.amount, now)?;

        let account = self.accounts.entry(message.user.clone()).or_default();
        account.total_deposited = account
            .total_deposited
            .checked_add(message.amount)
            .ok_or(BridgeError::Overflow)?;
        self.refresh_account(&message.user, now);

        let reply = self.build_reply(MessageKind::DepositAck, message, message.amount, 0, now);
        self.record(message, Outcome::Applied, reply);

        info!(
            message_id = %message.id,
            user = %message.user,
            amount = message.amount,
            "Deposit applied"
        );
        Ok(Outcome::Applied)
    }

    fn apply_withdraw_request(&mut self, message: &Message, now: u64) -> Result<Outcome> {
        let available = self.pool.position(&message.user, now).balance();
        if message.amount > available {
            return Ok(self.reject(message, RejectReason::InsufficientBalance, available, now));
        }

        let withdrawal = match self.pool.withdraw(&message.user, message.amount, now) {
            Ok(w) => w,
            Err(BridgeError::InsufficientLiquidity { available, .. }) => {
                return Ok(self.reject(message, RejectReason::InsufficientLiquidity, available, now));
            }
            Err(e) => return Err(e),
        };

        let account = self.accounts.entry(message.user.clone()).or_default();
        account.total_withdrawn = account.total_withdrawn.saturating_add(withdrawal.released);
        self.refresh_account(&message.user, now);

        let reply = self.build_reply(
            MessageKind::WithdrawConfirm,
            message,
            withdrawal.released,
            withdrawal.yield_portion,
            now,
        );
        self.record(message, Outcome::Applied, reply);

        info!(
            message_id = %message.id,
            user = %message.user,
            released = withdrawal.released,
            yield_portion = withdrawal.yield_portion,
            "Withdrawal confirmed"
        );
        Ok(Outcome::Applied)
    }

    fn reject(
        &mut self,
        message: &Message,
        reason: RejectReason,
        available: Amount,
        now: u64,
    ) -> Outcome {
        let reply = self.build_reply(MessageKind::WithdrawReject, message, message.amount, 0, now);
        let outcome = Outcome::Rejected(reason);
        self.record(message, outcome, reply);

        warn!(
            message_id = %message.id,
            user = %message.user,
            requested = message.amount,
            available = available,
            reason = %reason,
            "Withdrawal rejected"
        );
        outcome
    }

    fn build_reply(
        &mut self,
        kind: MessageKind,
        request: &Message,
        amount: Amount,
        yield_amount: Amount,
        now: u64,
    ) -> Message {
        self.outbound_nonce += 1;
        Message::new(
            self.outbound_nonce,
            self.config.domain,
            self.config.origin_domain,
            kind,
            request.id,
            request.user.clone(),
            amount,
            yield_amount,
            now,
        )
    }

    fn record(&mut self, request: &Message, outcome: Outcome, reply: Message) {
        self.processed.mark(request.id);
        // the origin drops syncs while a withdrawal is in flight
        if request.kind == MessageKind::WithdrawRequest {
            self.synced_yield.remove(&request.user);
        }
        self.inbound.insert(
            request.id,
            InboundRecord {
                kind: request.kind,
                outcome,
                acked: false,
                reply,
            },
        );
    }

    /// Hand the stored reply for `id` to the channel. Returns true when accepted.
    async fn send_reply(&mut self, id: &MessageId) -> bool {
        let Some(record) = self.inbound.get(id) else {
            return false;
        };
        let envelope = Envelope {
            origin: self.config.address.clone(),
            message: record.reply.clone(),
        };
        let reply_id = envelope.message.id;
        let channel = Arc::clone(&self.channel);

        match channel.send(envelope).await {
            Ok(()) => {
                if let Some(record) = self.inbound.get_mut(id) {
                    record.acked = true;
                }
                debug!(message_id = %id, reply_id = %reply_id, "Reply sent");
                true
            }
            Err(e) => {
                warn!(
                    message_id = %id,
                    reply_id = %reply_id,
                    error = %e,
                    "Reply send failed, left in outbox"
                );
                false
            }
        }
    }

    /// Mirror the pool position into the user's ledger entry
    fn refresh_account(&mut self, user: &Address, now: u64) {
        let position = self.pool.position(user, now);
        let account = self.accounts.entry(user.clone()).or_default();
        account.principal = position.principal;
        account.accrued_yield = position.accrued_yield;
    }

    // ========================================================================
    // Outbox and yield sync
    // ========================================================================

    /// Re-send every reply that was never accepted by the channel
    ///
    /// Returns the number of replies sent.
    pub async fn flush_outbox(&mut self) -> Result<usize> {
        self.ensure_running()?;
        let unacked: Vec<MessageId> = self
            .inbound
            .iter()
            .filter(|(_, r)| !r.acked)
            .map(|(id, _)| *id)
            .collect();

        let mut sent = 0;
        for id in &unacked {
            if self.send_reply(id).await {
                sent += 1;
            }
        }
        if sent > 0 {
            info!(sent = sent, remaining = unacked.len() - sent, "Outbox flushed");
            self.persist()?;
        }
        Ok(sent)
    }

    /// Report accrued yield to the origin for every user whose figure moved
    ///
    /// Returns the number of sync messages sent.
    pub async fn sync_yield(&mut self, now: u64) -> Result<usize> {
        self.ensure_running()?;
        let changed: Vec<(Address, Amount, Amount)> = self
            .pool
            .depositors()
            .filter_map(|user| {
                let position = match self.pool.checked_position(user, now) {
                    Ok(position) => position,
                    Err(e) => {
                        warn!(user = %user, error = %e, "Skipping yield sync");
                        return None;
                    }
                };
                let last = self.synced_yield.get(user).copied().unwrap_or(0);
                (position.accrued_yield != last).then(|| {
                    (user.clone(), position.principal, position.accrued_yield)
                })
            })
            .collect();

        let mut sent = 0;
        for (user, principal, accrued) in changed {
            self.outbound_nonce += 1;
            let message = Message::new(
                self.outbound_nonce,
                self.config.domain,
                self.config.origin_domain,
                MessageKind::YieldSync,
                MessageId::zero(),
                user.clone(),
                principal,
                accrued,
                now,
            );
            let envelope = Envelope {
                origin: self.config.address.clone(),
                message,
            };
            match self.channel.send(envelope).await {
                Ok(()) => {
                    self.synced_yield.insert(user, accrued);
                    sent += 1;
                }
                Err(e) => {
                    warn!(user = %user, error = %e, "Yield sync send failed");
                }
            }
        }
        if sent > 0 {
            debug!(sent = sent, "Yield sync sent");
        }
        self.persist()?;
        Ok(sent)
    }

    // ========================================================================
    // Owner operations and queries
    // ========================================================================

    pub fn add_liquidity(&mut self, caller: &Address, amount: Amount) -> Result<()> {
        self.ensure_running()?;
        self.pool.add_liquidity(caller, amount)?;
        self.persist()
    }

    pub fn get_lending_pool(&self) -> &Address {
        &self.config.lending_pool
    }

    pub fn owner(&self) -> &Address {
        &self.config.owner
    }

    pub fn address(&self) -> &Address {
        &self.config.address
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn pool(&self) -> &YieldPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.pool_stats()
    }

    /// The user's destination-side ledger entry with accrual up to `now`
    pub fn user_account(&self, user: &Address, now: u64) -> UserAccount {
        let mut account = self.accounts.get(user).cloned().unwrap_or_default();
        let position = self.pool.position(user, now);
        account.principal = position.principal;
        account.accrued_yield = position.accrued_yield;
        account
    }

    pub fn inbound_record(&self, id: &MessageId) -> Option<&InboundRecord> {
        self.inbound.get(id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Replies not yet accepted by the channel
    pub fn pending_replies(&self) -> usize {
        self.inbound.values().filter(|r| !r.acked).count()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.pool.check_invariants()?;
        for (user, account) in &self.accounts {
            if !account.is_consistent() {
                return Err(format!("account {} locks more than its balance", user));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            config: self.config.clone(),
            pool: self.pool.clone(),
            accounts: self.accounts.clone(),
            processed: self.processed.clone(),
            inbound: self.inbound.clone(),
            outbound_nonce: self.outbound_nonce,
            synced_yield: self.synced_yield.clone(),
        }
    }

    /// Write the current snapshot if a store is attached
    pub fn persist(&self) -> Result<()> {
        match &self.store {
            Some(store) => save_json(store.as_ref(), RECEIVER_SNAPSHOT_KEY, &self.snapshot()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::QueueChannel;
    use crate::pool::PoolConfig;
    use crate::store::MemoryStore;
    use crate::types::UNIT;

    const PERIOD: u64 = 3_600;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            address: addr("receiver"),
            owner: addr("receiver-owner"),
            domain: DomainId::Destination,
            origin_domain: DomainId::Origin,
            sender_address: addr("sender"),
            lending_pool: addr("pool"),
        }
    }

    fn pool(address: &str) -> YieldPool {
        YieldPool::new(PoolConfig {
            address: addr(address),
            owner: addr("pool-owner"),
            yield_rate_bps: 500,
            accrual_period_secs: PERIOD,
        })
        .unwrap()
    }

    fn setup() -> (Receiver, Arc<QueueChannel>) {
        let channel = Arc::new(QueueChannel::new());
        let receiver = Receiver::new(config(), pool("pool"), channel.clone());
        (receiver, channel)
    }

    fn inbound(kind: MessageKind, nonce: u64, amount: Amount) -> Envelope {
        Envelope {
            origin: addr("sender"),
            message: Message::new(
                nonce,
                DomainId::Origin,
                DomainId::Destination,
                kind,
                MessageId::zero(),
                addr("alice"),
                amount,
                0,
                0,
            ),
        }
    }

    #[tokio::test]
    async fn test_deposit_applied_and_acked() {
        let (mut receiver, channel) = setup();
        let envelope = inbound(MessageKind::Deposit, 1, UNIT);
        let deposit_id = envelope.message.id;

        let outcome = receiver.handle(envelope, 0).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);

        let replies = channel.drain();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].origin, addr("receiver"));
        assert_eq!(replies[0].message.kind, MessageKind::DepositAck);
        assert_eq!(replies[0].message.reference, deposit_id);
        assert_eq!(
            receiver.inbound_record(&deposit_id).unwrap().state(),
            InboundState::Acked
        );
        assert_eq!(receiver.user_account(&addr("alice"), 0).principal, UNIT);
        assert_eq!(receiver.pool_stats().total_deposits, UNIT);
    }

    #[tokio::test]
    async fn test_duplicate_deposit_resends_same_ack() {
        let (mut receiver, channel) = setup();
        let envelope = inbound(MessageKind::Deposit, 1, UNIT);

        receiver.handle(envelope.clone(), 0).await.unwrap();
        let first = channel.drain();
        let outcome = receiver.handle(envelope, 0).await.unwrap();
        let second = channel.drain();

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(first[0].message, second[0].message);
        assert_eq!(receiver.pool_stats().total_deposits, UNIT);
        assert_eq!(receiver.processed_count(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_origin() {
        let (mut receiver, channel) = setup();
        let mut envelope = inbound(MessageKind::Deposit, 1, UNIT);
        envelope.origin = addr("mallory");

        let err = receiver.handle(envelope, 0).await.unwrap_err();
        assert!(matches!(err, BridgeError::Unauthorized { .. }));
        assert!(channel.is_empty());
        assert_eq!(receiver.processed_count(), 0);
    }

    #[tokio::test]
    async fn test_domain_mismatch() {
        let (mut receiver, _channel) = setup();
        let mut envelope = inbound(MessageKind::Deposit, 1, UNIT);
        envelope.message.source_domain = DomainId::Destination;

        let err = receiver.handle(envelope, 0).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::DomainMismatch {
                expected: DomainId::Origin,
                got: DomainId::Destination,
            }
        );
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (mut receiver, _channel) = setup();
        let err = receiver
            .handle(inbound(MessageKind::Deposit, 1, 0), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_reply_kinds_not_accepted() {
        let (mut receiver, _channel) = setup();
        let err = receiver
            .handle(inbound(MessageKind::WithdrawConfirm, 1, UNIT), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnexpectedMessageKind { .. }));
    }

    #[tokio::test]
    async fn test_withdraw_before_deposit_rejected() {
        let (mut receiver, channel) = setup();
        let envelope = inbound(MessageKind::WithdrawRequest, 2, UNIT);

        let outcome = receiver.handle(envelope.clone(), 0).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Rejected(RejectReason::InsufficientBalance)
        );
        let reply = channel.pop().unwrap().message;
        assert_eq!(reply.kind, MessageKind::WithdrawReject);
        assert_eq!(reply.reference, envelope.message.id);
        assert_eq!(reply.amount, UNIT);

        // A later delivery of the same request stays rejected
        assert_eq!(
            receiver.handle(envelope, 0).await.unwrap(),
            Outcome::Duplicate
        );
        assert_eq!(channel.pop().unwrap().message, reply);
    }

    #[tokio::test]
    async fn test_withdraw_confirm_carries_yield_portion() {
        let (mut receiver, channel) = setup();
        receiver
            .add_liquidity(&addr("pool-owner"), UNIT)
            .unwrap();
        receiver
            .handle(inbound(MessageKind::Deposit, 1, UNIT), 0)
            .await
            .unwrap();
        channel.drain();

        let outcome = receiver
            .handle(inbound(MessageKind::WithdrawRequest, 2, 1_050_000), PERIOD)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);

        let reply = channel.pop().unwrap().message;
        assert_eq!(reply.kind, MessageKind::WithdrawConfirm);
        assert_eq!(reply.amount, 1_050_000);
        assert_eq!(reply.yield_amount, 50_000);
        assert_eq!(receiver.user_account(&addr("alice"), PERIOD).balance(), 0);
        receiver.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_liquidity_rejects() {
        let (mut receiver, channel) = setup();
        receiver
            .handle(inbound(MessageKind::Deposit, 1, UNIT), 0)
            .await
            .unwrap();
        channel.drain();
        let before = receiver.pool().state().clone();

        let outcome = receiver
            .handle(inbound(MessageKind::WithdrawRequest, 2, 1_050_000), PERIOD)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Rejected(RejectReason::InsufficientLiquidity)
        );
        assert_eq!(channel.pop().unwrap().message.kind, MessageKind::WithdrawReject);
        assert_eq!(receiver.pool().state(), &before);
    }

    #[tokio::test]
    async fn test_failed_reply_stays_in_outbox() {
        let (mut receiver, channel) = setup();
        channel.fail_next_sends(1);
        let envelope = inbound(MessageKind::Deposit, 1, UNIT);
        let id = envelope.message.id;

        assert_eq!(receiver.handle(envelope, 0).await.unwrap(), Outcome::Applied);
        assert!(channel.is_empty());
        assert_eq!(receiver.inbound_record(&id).unwrap().state(), InboundState::Applied);
        assert_eq!(receiver.pending_replies(), 1);

        assert_eq!(receiver.flush_outbox().await.unwrap(), 1);
        assert_eq!(channel.len(), 1);
        assert_eq!(receiver.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_pool_mismatch_halts() {
        let channel = Arc::new(QueueChannel::new());
        let mut receiver = Receiver::new(config(), pool("other-pool"), channel.clone());
        assert!(receiver.is_halted());

        let err = receiver
            .handle(inbound(MessageKind::Deposit, 1, UNIT), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::GatewayHalted { .. }));

        let mut fixed = config();
        fixed.lending_pool = addr("other-pool");
        receiver.reconfigure(fixed).unwrap();
        assert!(!receiver.is_halted());
        assert_eq!(receiver.get_lending_pool(), &addr("other-pool"));
    }

    #[tokio::test]
    async fn test_verify_peer_mismatch_halts() {
        let (mut receiver, _channel) = setup();
        let err = receiver
            .verify_peer(&addr("sender"), &addr("someone-else"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigMismatch { .. }));
        assert!(receiver.is_halted());
        assert!(matches!(
            receiver.flush_outbox().await,
            Err(BridgeError::GatewayHalted { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_yield_only_when_changed() {
        let (mut receiver, channel) = setup();
        receiver
            .handle(inbound(MessageKind::Deposit, 1, UNIT), 0)
            .await
            .unwrap();
        channel.drain();

        assert_eq!(receiver.sync_yield(10).await.unwrap(), 0);
        assert_eq!(receiver.sync_yield(PERIOD).await.unwrap(), 1);
        let sync = channel.pop().unwrap().message;
        assert_eq!(sync.kind, MessageKind::YieldSync);
        assert_eq!(sync.amount, UNIT);
        assert_eq!(sync.yield_amount, 50_000);
        assert_eq!(receiver.sync_yield(PERIOD + 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_withdraw_reply_forces_next_sync() {
        let (mut receiver, channel) = setup();
        receiver
            .handle(inbound(MessageKind::Deposit, 1, UNIT), 0)
            .await
            .unwrap();
        assert_eq!(receiver.sync_yield(PERIOD).await.unwrap(), 1);
        channel.drain();

        let outcome = receiver
            .handle(inbound(MessageKind::WithdrawRequest, 2, 1_050_000), PERIOD)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Rejected(RejectReason::InsufficientLiquidity)
        );
        channel.drain();

        // unchanged figure, but the origin may have dropped the last sync
        assert_eq!(receiver.sync_yield(PERIOD + 1).await.unwrap(), 1);
        assert_eq!(channel.pop().unwrap().message.yield_amount, 50_000);
        assert_eq!(receiver.sync_yield(PERIOD + 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_skips_overflowing_position() {
        let (mut receiver, channel) = setup();
        receiver
            .handle(inbound(MessageKind::Deposit, 1, u128::MAX / 10), 0)
            .await
            .unwrap();
        channel.drain();

        assert_eq!(receiver.sync_yield(PERIOD).await.unwrap(), 0);
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(QueueChannel::new());
        let mut receiver =
            Receiver::new(config(), pool("pool"), channel.clone()).with_store(store.clone());
        let envelope = inbound(MessageKind::Deposit, 1, UNIT);
        receiver.handle(envelope.clone(), 0).await.unwrap();
        channel.drain();

        let mut restored = Receiver::load(store, channel.clone()).unwrap().unwrap();
        assert_eq!(restored.snapshot(), receiver.snapshot());
        assert_eq!(
            restored.handle(envelope, 0).await.unwrap(),
            Outcome::Duplicate
        );
    }
}
