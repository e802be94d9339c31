//! Origin-side gateway
//!
//! Escrows user deposits and announces them to the destination, then drives
//! withdrawals: the requested amount is locked locally, a WithdrawRequest
//! goes out, and escrow is only released once the matching WithdrawConfirm
//! comes back. A WithdrawReject unlocks without releasing.
//!
//! The sender's per-user figures are a local view. Accrued yield is refreshed
//! by YieldSync messages from the destination, ordered by the destination's
//! outbound nonce so a stale sync never overwrites a newer confirm.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{Envelope, MessageChannel};
use crate::error::{BridgeError, Result};
use crate::message::{Message, MessageKind};
use crate::processed::ProcessedMessageSet;
use crate::store::{load_json, save_json, SnapshotStore};
use crate::types::{Address, Amount, DomainId, MessageId, Outcome, UserAccount};

/// Snapshot key used by [`Sender::persist`]
pub const SENDER_SNAPSHOT_KEY: &str = "sender";

/// Default time a withdrawal may wait for its reply before it is stuck (1 hour)
pub const DEFAULT_WITHDRAW_TIMEOUT_SECS: u64 = 3_600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    /// This gateway's own address, stamped as envelope origin
    pub address: Address,
    pub owner: Address,
    pub domain: DomainId,
    pub dest_domain: DomainId,
    /// The only receiver gateway whose replies are accepted
    pub receiver_address: Address,
    pub withdraw_timeout_secs: u64,
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.domain == self.dest_domain {
            return Err(BridgeError::ConfigMismatch {
                field: "dest_domain".to_string(),
                expected: self.domain.peer().to_string(),
                got: self.dest_domain.to_string(),
            });
        }
        if self.withdraw_timeout_secs == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "withdraw timeout must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Funds the sender holds pending settlement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub balance: Amount,
    pub total_released: Amount,
    pub total_yield_received: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Locked locally, never accepted by the channel
    Undelivered,
    /// Sent, waiting for a reply
    Pending,
    /// No reply within the timeout, needs a manual retry
    Stuck,
    Confirmed,
    Rejected,
    /// Given up before it was ever delivered; lock released
    Abandoned,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Undelivered => "undelivered",
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Stuck => "stuck",
            WithdrawalStatus::Confirmed => "confirmed",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Abandoned => "abandoned",
        }
    }

    /// Still holding a lock and waiting on the destination
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Undelivered | WithdrawalStatus::Pending | WithdrawalStatus::Stuck
        )
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub id: MessageId,
    pub user: Address,
    pub amount: Amount,
    pub requested_at: u64,
    pub last_sent_at: u64,
    pub attempts: u32,
    pub status: WithdrawalStatus,
    /// The request exactly as first built, re-sent verbatim on retry
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub id: MessageId,
    pub user: Address,
    pub amount: Amount,
    pub created_at: u64,
    pub last_sent_at: u64,
    pub acknowledged: bool,
    pub message: Message,
}

/// Everything the sender needs to resume after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSnapshot {
    pub config: SenderConfig,
    pub accounts: BTreeMap<Address, UserAccount>,
    pub escrow: EscrowAccount,
    pub processed: ProcessedMessageSet,
    pub deposits: BTreeMap<MessageId, DepositRecord>,
    pub withdrawals: BTreeMap<MessageId, PendingWithdrawal>,
    pub nonce: u64,
}

pub struct Sender {
    config: SenderConfig,
    accounts: BTreeMap<Address, UserAccount>,
    escrow: EscrowAccount,
    processed: ProcessedMessageSet,
    deposits: BTreeMap<MessageId, DepositRecord>,
    withdrawals: BTreeMap<MessageId, PendingWithdrawal>,
    nonce: u64,
    channel: Arc<dyn MessageChannel>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl Sender {
    pub fn new(config: SenderConfig, channel: Arc<dyn MessageChannel>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            accounts: BTreeMap::new(),
            escrow: EscrowAccount::default(),
            processed: ProcessedMessageSet::new(),
            deposits: BTreeMap::new(),
            withdrawals: BTreeMap::new(),
            nonce: 0,
            channel,
            store: None,
        })
    }

    pub fn restore(snapshot: SenderSnapshot, channel: Arc<dyn MessageChannel>) -> Result<Self> {
        snapshot.config.validate()?;
        let sender = Self {
            config: snapshot.config,
            accounts: snapshot.accounts,
            escrow: snapshot.escrow,
            processed: snapshot.processed,
            deposits: snapshot.deposits,
            withdrawals: snapshot.withdrawals,
            nonce: snapshot.nonce,
            channel,
            store: None,
        };
        info!(
            nonce = sender.nonce,
            in_flight = sender.in_flight_withdrawals(),
            "Sender restored from snapshot"
        );
        Ok(sender)
    }

    /// Load the last persisted snapshot from `store`, if any
    pub fn load(
        store: Arc<dyn SnapshotStore>,
        channel: Arc<dyn MessageChannel>,
    ) -> Result<Option<Self>> {
        let snapshot: Option<SenderSnapshot> = load_json(store.as_ref(), SENDER_SNAPSHOT_KEY)?;
        match snapshot {
            Some(s) => Ok(Some(Self::restore(s, channel)?.with_store(store))),
            None => Ok(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn next_message(
        &mut self,
        kind: MessageKind,
        user: &Address,
        amount: Amount,
        now: u64,
    ) -> Message {
        self.nonce += 1;
        Message::new(
            self.nonce,
            self.config.domain,
            self.config.dest_domain,
            kind,
            MessageId::zero(),
            user.clone(),
            amount,
            0,
            now,
        )
    }

    async fn send(&self, message: Message) -> std::result::Result<(), String> {
        let envelope = Envelope {
            origin: self.config.address.clone(),
            message,
        };
        self.channel
            .send(envelope)
            .await
            .map_err(|e| e.to_string())
    }

    // ========================================================================
    // User operations
    // ========================================================================

    /// Escrow `amount` for `user` and announce the deposit
    ///
    /// If the channel refuses the message the escrow and principal increments
    /// are rolled back. The nonce stays consumed.
    pub async fn deposit(&mut self, user: &Address, amount: Amount, now: u64) -> Result<MessageId> {
        if amount == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "deposit amount must be greater than 0".to_string(),
            });
        }

        let new_balance = self
            .escrow
            .balance
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;
        let existed = self.accounts.contains_key(user);
        let previous = self.accounts.get(user).cloned().unwrap_or_default();
        let principal = previous
            .principal
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;
        let total_deposited = previous
            .total_deposited
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;

        let message = self.next_message(MessageKind::Deposit, user, amount, now);
        let id = message.id;

        self.escrow.balance = new_balance;
        let account = self.accounts.entry(user.clone()).or_default();
        account.principal = principal;
        account.total_deposited = total_deposited;
        self.deposits.insert(
            id,
            DepositRecord {
                id,
                user: user.clone(),
                amount,
                created_at: now,
                last_sent_at: now,
                acknowledged: false,
                message: message.clone(),
            },
        );
        self.persist()?;

        if let Err(reason) = self.send(message).await {
            self.escrow.balance -= amount;
            if existed {
                self.accounts.insert(user.clone(), previous);
            } else {
                self.accounts.remove(user);
            }
            self.deposits.remove(&id);
            self.persist()?;

            warn!(
                message_id = %id,
                user = %user,
                amount = amount,
                error = %reason,
                "Deposit send failed, escrow rolled back"
            );
            return Err(BridgeError::MessageDeliveryFailure { id, reason });
        }

        info!(
            message_id = %id,
            user = %user,
            amount = amount,
            escrow = self.escrow.balance,
            "Deposit escrowed"
        );
        Ok(id)
    }

    /// Lock `amount` of the user's balance and request it from the destination
    ///
    /// On a channel failure the lock is kept and the withdrawal is recorded as
    /// undelivered; retry it with [`Sender::retry_withdrawal`] or release it
    /// with [`Sender::abandon_withdrawal`].
    pub async fn withdraw(&mut self, user: &Address, amount: Amount, now: u64) -> Result<MessageId> {
        if amount == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "withdraw amount must be greater than 0".to_string(),
            });
        }
        let available = self
            .accounts
            .get(user)
            .map(|a| a.available())
            .unwrap_or(0);
        if amount > available {
            return Err(BridgeError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let message = self.next_message(MessageKind::WithdrawRequest, user, amount, now);
        let id = message.id;

        if let Some(account) = self.accounts.get_mut(user) {
            account.locked_for_withdrawal += amount;
        }
        self.withdrawals.insert(
            id,
            PendingWithdrawal {
                id,
                user: user.clone(),
                amount,
                requested_at: now,
                last_sent_at: now,
                attempts: 0,
                status: WithdrawalStatus::Undelivered,
                message: message.clone(),
            },
        );
        self.persist()?;

        if let Err(reason) = self.send(message).await {
            warn!(
                message_id = %id,
                user = %user,
                amount = amount,
                error = %reason,
                "Withdraw request send failed, lock kept"
            );
            return Err(BridgeError::MessageDeliveryFailure { id, reason });
        }

        if let Some(w) = self.withdrawals.get_mut(&id) {
            w.status = WithdrawalStatus::Pending;
            w.attempts = 1;
        }
        self.persist()?;

        info!(
            message_id = %id,
            user = %user,
            amount = amount,
            "Withdrawal requested"
        );
        Ok(id)
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    /// Apply one delivered reply or sync from the destination
    pub async fn handle(&mut self, envelope: Envelope, now: u64) -> Result<Outcome> {
        self.validate_inbound(&envelope)?;

        let message = envelope.message;
        if self.processed.contains(&message.id) {
            debug!(message_id = %message.id, kind = %message.kind, "Duplicate delivery ignored");
            return Ok(Outcome::Duplicate);
        }

        match message.kind {
            MessageKind::WithdrawConfirm => self.apply_confirm(&message)?,
            MessageKind::WithdrawReject => self.apply_reject(&message)?,
            MessageKind::DepositAck => self.apply_deposit_ack(&message)?,
            MessageKind::YieldSync => self.apply_yield_sync(&message),
            other => {
                return Err(BridgeError::UnexpectedMessageKind {
                    got: other.to_string(),
                })
            }
        }

        self.processed.mark(message.id);
        self.persist()?;
        debug!(message_id = %message.id, kind = %message.kind, now = now, "Inbound message applied");
        Ok(Outcome::Applied)
    }

    fn validate_inbound(&self, envelope: &Envelope) -> Result<()> {
        if envelope.origin != self.config.receiver_address {
            return Err(BridgeError::Unauthorized {
                caller: envelope.origin.to_string(),
            });
        }
        let message = &envelope.message;
        if message.source_domain != self.config.dest_domain {
            return Err(BridgeError::DomainMismatch {
                expected: self.config.dest_domain,
                got: message.source_domain,
            });
        }
        if message.dest_domain != self.config.domain {
            return Err(BridgeError::DomainMismatch {
                expected: self.config.domain,
                got: message.dest_domain,
            });
        }
        Ok(())
    }

    /// Look up the withdrawal a reply answers and check it belongs to the user
    fn reply_target(&self, message: &Message) -> Result<PendingWithdrawal> {
        let withdrawal = self
            .withdrawals
            .get(&message.reference)
            .cloned()
            .ok_or(BridgeError::WithdrawalNotFound {
                id: message.reference,
            })?;
        if withdrawal.user != message.user {
            return Err(BridgeError::Unauthorized {
                caller: message.user.to_string(),
            });
        }
        if matches!(
            withdrawal.status,
            WithdrawalStatus::Confirmed | WithdrawalStatus::Rejected
        ) {
            return Err(BridgeError::InvalidWithdrawalState {
                id: withdrawal.id,
                status: withdrawal.status.to_string(),
                expected: "in flight".to_string(),
            });
        }
        Ok(withdrawal)
    }

    fn apply_confirm(&mut self, message: &Message) -> Result<()> {
        let withdrawal = self.reply_target(message)?;
        if message.amount != withdrawal.amount || message.yield_amount > message.amount {
            return Err(BridgeError::InvalidAmount {
                reason: format!(
                    "confirm for {} releases {} (yield {}), requested {}",
                    withdrawal.id, message.amount, message.yield_amount, withdrawal.amount
                ),
            });
        }

        let released = message.amount;
        let yield_portion = message.yield_amount;
        let principal_portion = released - yield_portion;
        let abandoned = withdrawal.status == WithdrawalStatus::Abandoned;

        let account = self.accounts.entry(withdrawal.user.clone()).or_default();
        if !abandoned {
            account.locked_for_withdrawal = account.locked_for_withdrawal.saturating_sub(released);
        }
        if message.nonce > account.synced_sequence {
            account.accrued_yield = account.accrued_yield.saturating_sub(yield_portion);
            account.synced_sequence = message.nonce;
        }
        account.principal = account.principal.saturating_sub(principal_portion);
        account.total_withdrawn = account.total_withdrawn.saturating_add(released);

        self.escrow.balance = self
            .escrow
            .balance
            .saturating_add(yield_portion)
            .saturating_sub(released);
        self.escrow.total_released = self.escrow.total_released.saturating_add(released);
        self.escrow.total_yield_received =
            self.escrow.total_yield_received.saturating_add(yield_portion);

        if let Some(w) = self.withdrawals.get_mut(&withdrawal.id) {
            w.status = WithdrawalStatus::Confirmed;
        }

        if abandoned {
            warn!(
                withdrawal_id = %withdrawal.id,
                user = %withdrawal.user,
                released = released,
                "Confirm arrived for an abandoned withdrawal, released anyway"
            );
        } else {
            info!(
                withdrawal_id = %withdrawal.id,
                user = %withdrawal.user,
                released = released,
                yield_portion = yield_portion,
                "Withdrawal released from escrow"
            );
        }
        Ok(())
    }

    fn apply_reject(&mut self, message: &Message) -> Result<()> {
        let withdrawal = self.reply_target(message)?;

        if withdrawal.status != WithdrawalStatus::Abandoned {
            if let Some(account) = self.accounts.get_mut(&withdrawal.user) {
                account.locked_for_withdrawal =
                    account.locked_for_withdrawal.saturating_sub(withdrawal.amount);
            }
        }
        if let Some(w) = self.withdrawals.get_mut(&withdrawal.id) {
            w.status = WithdrawalStatus::Rejected;
        }

        info!(
            withdrawal_id = %withdrawal.id,
            user = %withdrawal.user,
            amount = withdrawal.amount,
            "Withdrawal rejected by destination, lock released"
        );
        Ok(())
    }

    fn apply_deposit_ack(&mut self, message: &Message) -> Result<()> {
        let deposit = self
            .deposits
            .get_mut(&message.reference)
            .ok_or(BridgeError::DepositNotFound {
                id: message.reference,
            })?;
        deposit.acknowledged = true;
        debug!(deposit_id = %deposit.id, user = %deposit.user, "Deposit acknowledged");
        Ok(())
    }

    fn apply_yield_sync(&mut self, message: &Message) {
        // A sync taken after an in-flight withdrawal was paid would drop the
        // yield under the lock; the confirm will carry the yield portion instead
        let in_flight = self
            .withdrawals
            .values()
            .any(|w| w.user == message.user && w.status.is_in_flight());

        let Some(account) = self.accounts.get_mut(&message.user) else {
            debug!(user = %message.user, "Yield sync for unknown user ignored");
            return;
        };
        if in_flight {
            debug!(user = %message.user, "Yield sync deferred, withdrawal in flight");
            return;
        }
        if message.nonce <= account.synced_sequence {
            debug!(
                user = %message.user,
                nonce = message.nonce,
                synced_sequence = account.synced_sequence,
                "Stale yield sync ignored"
            );
            return;
        }
        account.accrued_yield = message.yield_amount;
        account.synced_sequence = message.nonce;
        debug!(
            user = %message.user,
            accrued_yield = message.yield_amount,
            "Yield view refreshed"
        );
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Move withdrawals that waited longer than the timeout to `Stuck`
    pub fn expire_pending(&mut self, now: u64) -> Result<Vec<MessageId>> {
        let timeout = self.config.withdraw_timeout_secs;
        let mut expired = Vec::new();
        for w in self.withdrawals.values_mut() {
            if w.status == WithdrawalStatus::Pending && now.saturating_sub(w.last_sent_at) >= timeout
            {
                w.status = WithdrawalStatus::Stuck;
                expired.push(w.id);
                warn!(
                    withdrawal_id = %w.id,
                    user = %w.user,
                    amount = w.amount,
                    waited_secs = now.saturating_sub(w.last_sent_at),
                    "Withdrawal stuck, awaiting manual retry"
                );
            }
        }
        if !expired.is_empty() {
            self.persist()?;
        }
        Ok(expired)
    }

    /// Re-send an in-flight withdrawal with its original id
    pub async fn retry_withdrawal(&mut self, id: &MessageId, now: u64) -> Result<()> {
        let withdrawal = self
            .withdrawals
            .get(id)
            .cloned()
            .ok_or(BridgeError::WithdrawalNotFound { id: *id })?;
        if !withdrawal.status.is_in_flight() {
            return Err(BridgeError::InvalidWithdrawalState {
                id: *id,
                status: withdrawal.status.to_string(),
                expected: "undelivered, pending or stuck".to_string(),
            });
        }

        if let Err(reason) = self.send(withdrawal.message.clone()).await {
            warn!(withdrawal_id = %id, error = %reason, "Withdrawal retry send failed");
            return Err(BridgeError::MessageDeliveryFailure { id: *id, reason });
        }

        if let Some(w) = self.withdrawals.get_mut(id) {
            w.status = WithdrawalStatus::Pending;
            w.attempts += 1;
            w.last_sent_at = now;
            info!(withdrawal_id = %id, attempts = w.attempts, "Withdrawal re-sent");
        }
        self.persist()
    }

    /// Release the lock of a withdrawal that never reached the channel
    pub fn abandon_withdrawal(&mut self, id: &MessageId) -> Result<()> {
        let withdrawal = self
            .withdrawals
            .get_mut(id)
            .ok_or(BridgeError::WithdrawalNotFound { id: *id })?;
        if withdrawal.status != WithdrawalStatus::Undelivered {
            return Err(BridgeError::InvalidWithdrawalState {
                id: *id,
                status: withdrawal.status.to_string(),
                expected: WithdrawalStatus::Undelivered.to_string(),
            });
        }
        withdrawal.status = WithdrawalStatus::Abandoned;
        let (user, amount) = (withdrawal.user.clone(), withdrawal.amount);

        if let Some(account) = self.accounts.get_mut(&user) {
            account.locked_for_withdrawal = account.locked_for_withdrawal.saturating_sub(amount);
        }
        info!(withdrawal_id = %id, user = %user, amount = amount, "Withdrawal abandoned");
        self.persist()
    }

    /// Re-send deposits not acknowledged within the timeout
    ///
    /// Returns the number of deposits re-sent.
    pub async fn replay_unacknowledged(&mut self, now: u64) -> Result<usize> {
        let timeout = self.config.withdraw_timeout_secs;
        let due: Vec<MessageId> = self
            .deposits
            .values()
            .filter(|d| !d.acknowledged && now.saturating_sub(d.last_sent_at) >= timeout)
            .map(|d| d.id)
            .collect();
        self.resend_deposits(&due, now).await
    }

    async fn resend_deposits(&mut self, ids: &[MessageId], now: u64) -> Result<usize> {
        let mut sent = 0;
        for id in ids {
            let Some(message) = self.deposits.get(id).map(|d| d.message.clone()) else {
                continue;
            };
            match self.send(message).await {
                Ok(()) => {
                    if let Some(d) = self.deposits.get_mut(id) {
                        d.last_sent_at = now;
                    }
                    sent += 1;
                }
                Err(reason) => {
                    warn!(deposit_id = %id, error = %reason, "Deposit replay send failed");
                }
            }
        }
        if sent > 0 {
            info!(replayed = sent, "Unacknowledged deposits re-sent");
            self.persist()?;
        }
        Ok(sent)
    }

    /// Re-emit everything that may not have reached the destination
    ///
    /// Called after a restart. Pending and stuck withdrawals plus every
    /// unacknowledged deposit are re-sent with their original ids.
    pub async fn resume(&mut self, now: u64) -> Result<usize> {
        let withdrawals: Vec<MessageId> = self
            .withdrawals
            .values()
            .filter(|w| {
                matches!(
                    w.status,
                    WithdrawalStatus::Pending | WithdrawalStatus::Stuck
                )
            })
            .map(|w| w.id)
            .collect();

        let mut resent = 0;
        for id in &withdrawals {
            match self.retry_withdrawal(id, now).await {
                Ok(()) => resent += 1,
                Err(e) => warn!(withdrawal_id = %id, error = %e, "Resume could not re-send withdrawal"),
            }
        }

        let deposits: Vec<MessageId> = self
            .deposits
            .values()
            .filter(|d| !d.acknowledged)
            .map(|d| d.id)
            .collect();
        resent += self.resend_deposits(&deposits, now).await?;

        info!(resent = resent, "Sender resumed");
        Ok(resent)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Principal plus accrued yield, last locally known
    pub fn get_user_balance(&self, user: &Address) -> Amount {
        self.accounts.get(user).map(|a| a.balance()).unwrap_or(0)
    }

    pub fn get_user_total_yield(&self, user: &Address) -> Amount {
        self.accounts
            .get(user)
            .map(|a| a.accrued_yield)
            .unwrap_or(0)
    }

    pub fn get_user_total_deposited(&self, user: &Address) -> Amount {
        self.accounts
            .get(user)
            .map(|a| a.total_deposited)
            .unwrap_or(0)
    }

    pub fn user_account(&self, user: &Address) -> UserAccount {
        self.accounts.get(user).cloned().unwrap_or_default()
    }

    pub fn receiver_contract(&self) -> &Address {
        &self.config.receiver_address
    }

    pub fn owner(&self) -> &Address {
        &self.config.owner
    }

    pub fn address(&self) -> &Address {
        &self.config.address
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn escrow(&self) -> &EscrowAccount {
        &self.escrow
    }

    pub fn withdrawal(&self, id: &MessageId) -> Option<&PendingWithdrawal> {
        self.withdrawals.get(id)
    }

    pub fn deposit_record(&self, id: &MessageId) -> Option<&DepositRecord> {
        self.deposits.get(id)
    }

    pub fn stuck_withdrawals(&self) -> Vec<PendingWithdrawal> {
        self.withdrawals
            .values()
            .filter(|w| w.status == WithdrawalStatus::Stuck)
            .cloned()
            .collect()
    }

    pub fn in_flight_withdrawals(&self) -> usize {
        self.withdrawals
            .values()
            .filter(|w| w.status.is_in_flight())
            .count()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let principal: Amount = self.accounts.values().map(|a| a.principal).sum();
        if principal > self.escrow.balance {
            return Err(format!(
                "principal {} exceeds escrow balance {}",
                principal, self.escrow.balance
            ));
        }
        for (user, account) in &self.accounts {
            if !account.is_consistent() {
                return Err(format!("account {} locks more than its balance", user));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SenderSnapshot {
        SenderSnapshot {
            config: self.config.clone(),
            accounts: self.accounts.clone(),
            escrow: self.escrow.clone(),
            processed: self.processed.clone(),
            deposits: self.deposits.clone(),
            withdrawals: self.withdrawals.clone(),
            nonce: self.nonce,
        }
    }

    /// Write the current snapshot if a store is attached
    pub fn persist(&self) -> Result<()> {
        match &self.store {
            Some(store) => save_json(store.as_ref(), SENDER_SNAPSHOT_KEY, &self.snapshot()),
            None => Ok(()),
        }
    }
}
