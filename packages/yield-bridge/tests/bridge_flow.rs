//! End-to-end flows across Sender, channel, Receiver and Yield Pool
//!
//! Both gateways run in-process, joined by two `QueueChannel`s. Delivery is
//! driven by the test, and every message passes through the binary wire
//! codec on the way, so duplicates, drops and reordering are explicit.

use std::sync::Arc;

use yield_bridge::{
    Address, BridgeError, DomainId, Envelope, FileStore, Message, MessageKind, Outcome,
    PoolConfig, QueueChannel, Receiver, ReceiverConfig, RejectReason, Sender, SenderConfig,
    SnapshotStore, WithdrawalStatus, YieldPool, UNIT,
};

const PERIOD: u64 = 3_600;
const TIMEOUT: u64 = 600;

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

fn sender_config() -> SenderConfig {
    SenderConfig {
        address: addr("sender"),
        owner: addr("sender-owner"),
        domain: DomainId::Origin,
        dest_domain: DomainId::Destination,
        receiver_address: addr("receiver"),
        withdraw_timeout_secs: TIMEOUT,
    }
}

fn receiver_config() -> ReceiverConfig {
    ReceiverConfig {
        address: addr("receiver"),
        owner: addr("receiver-owner"),
        domain: DomainId::Destination,
        origin_domain: DomainId::Origin,
        sender_address: addr("sender"),
        lending_pool: addr("pool"),
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        address: addr("pool"),
        owner: addr("pool-owner"),
        yield_rate_bps: 500,
        accrual_period_secs: PERIOD,
    }
}

/// Transport round trip through the wire format
fn over_the_wire(envelope: Envelope) -> Envelope {
    let bytes = envelope.message.encode();
    Envelope {
        origin: envelope.origin,
        message: Message::decode(&bytes).unwrap(),
    }
}

struct Bridge {
    sender: Sender,
    receiver: Receiver,
    to_dest: Arc<QueueChannel>,
    to_origin: Arc<QueueChannel>,
}

impl Bridge {
    fn new() -> Self {
        let to_dest = Arc::new(QueueChannel::new());
        let to_origin = Arc::new(QueueChannel::new());
        let sender = Sender::new(sender_config(), to_dest.clone()).unwrap();
        let receiver = Receiver::new(
            receiver_config(),
            YieldPool::new(pool_config()).unwrap(),
            to_origin.clone(),
        );
        Self {
            sender,
            receiver,
            to_dest,
            to_origin,
        }
    }

    fn with_store(store: Arc<dyn SnapshotStore>) -> Self {
        let mut bridge = Self::new();
        bridge.sender = bridge.sender.with_store(store.clone());
        bridge.receiver = bridge.receiver.with_store(store);
        bridge
    }

    /// Rebuild both gateways from persisted snapshots with fresh channels
    fn reload(store: Arc<dyn SnapshotStore>) -> Self {
        let to_dest = Arc::new(QueueChannel::new());
        let to_origin = Arc::new(QueueChannel::new());
        let sender = Sender::load(store.clone(), to_dest.clone())
            .unwrap()
            .expect("sender snapshot");
        let receiver = Receiver::load(store, to_origin.clone())
            .unwrap()
            .expect("receiver snapshot");
        Self {
            sender,
            receiver,
            to_dest,
            to_origin,
        }
    }

    async fn deliver_to_receiver(&mut self, now: u64) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        for envelope in self.to_dest.drain() {
            let outcome = self
                .receiver
                .handle(over_the_wire(envelope), now)
                .await
                .unwrap();
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn deliver_to_sender(&mut self, now: u64) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        for envelope in self.to_origin.drain() {
            let outcome = self
                .sender
                .handle(over_the_wire(envelope), now)
                .await
                .unwrap();
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Deliver in both directions until both queues are empty
    async fn settle(&mut self, now: u64) {
        while !self.to_dest.is_empty() || !self.to_origin.is_empty() {
            self.deliver_to_receiver(now).await;
            self.deliver_to_sender(now).await;
            self.assert_invariants();
        }
    }

    fn assert_invariants(&self) {
        self.sender.check_invariants().unwrap();
        self.receiver.check_invariants().unwrap();
    }
}

// ============================================================================
// Deposits
// ============================================================================

mod deposits {
    use super::*;

    #[tokio::test]
    async fn test_deposit_reaches_pool_and_is_acknowledged() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");

        let id = bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.assert_invariants();
        assert_eq!(bridge.deliver_to_receiver(0).await, vec![Outcome::Applied]);
        assert_eq!(bridge.deliver_to_sender(0).await, vec![Outcome::Applied]);

        assert!(bridge.sender.deposit_record(&id).unwrap().acknowledged);
        assert_eq!(bridge.receiver.pool().user_deposit(&alice), UNIT);
        assert_eq!(bridge.receiver.pool_stats().total_deposits, UNIT);
        assert_eq!(bridge.sender.escrow().balance, UNIT);
        bridge.assert_invariants();
    }

    #[tokio::test]
    async fn test_duplicate_deposit_applied_once() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();

        let envelope = bridge.to_dest.pop().unwrap();
        let first = bridge
            .receiver
            .handle(over_the_wire(envelope.clone()), 0)
            .await
            .unwrap();
        let second = bridge
            .receiver
            .handle(over_the_wire(envelope), 5)
            .await
            .unwrap();

        assert_eq!(first, Outcome::Applied);
        assert_eq!(second, Outcome::Duplicate);
        assert_eq!(bridge.receiver.pool_stats().total_deposits, UNIT);

        // Both acks carry the same id; the second is a no-op on the sender
        let outcomes = bridge.deliver_to_sender(5).await;
        assert_eq!(outcomes, vec![Outcome::Applied, Outcome::Duplicate]);
        bridge.assert_invariants();
    }

    #[tokio::test]
    async fn test_lost_ack_replayed_with_same_id() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        let id = bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.deliver_to_receiver(0).await;
        bridge.to_origin.drain();

        assert_eq!(bridge.sender.replay_unacknowledged(TIMEOUT).await.unwrap(), 1);
        assert_eq!(
            bridge.deliver_to_receiver(TIMEOUT).await,
            vec![Outcome::Duplicate]
        );
        bridge.deliver_to_sender(TIMEOUT).await;

        assert!(bridge.sender.deposit_record(&id).unwrap().acknowledged);
        assert_eq!(bridge.receiver.pool_stats().total_deposits, UNIT);
    }
}

// ============================================================================
// Withdrawals
// ============================================================================

mod withdrawals {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_without_elapsed_period_releases_deposit() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, 2 * UNIT, 0).await.unwrap();
        bridge.settle(0).await;

        let id = bridge.sender.withdraw(&alice, 2 * UNIT, 10).await.unwrap();
        bridge.settle(20).await;

        let w = bridge.sender.withdrawal(&id).unwrap();
        assert_eq!(w.status, WithdrawalStatus::Confirmed);
        assert_eq!(bridge.sender.escrow().total_released, 2 * UNIT);
        assert_eq!(bridge.sender.escrow().balance, 0);
        assert_eq!(bridge.sender.get_user_balance(&alice), 0);
        assert_eq!(bridge.receiver.pool_stats().liquidity, 0);
        assert_eq!(bridge.receiver.pool_stats().total_withdrawn, 2 * UNIT);
    }

    #[tokio::test]
    async fn test_over_withdraw_is_rejected_without_state_change() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;
        let before = bridge.sender.snapshot();

        let err = bridge.sender.withdraw(&alice, UNIT + 1, 0).await.unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientFunds { .. }));
        assert_eq!(bridge.sender.snapshot(), before);
        assert!(bridge.to_dest.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_confirm_releases_once() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;
        bridge.sender.withdraw(&alice, UNIT, 0).await.unwrap();
        bridge.deliver_to_receiver(0).await;

        let confirm = bridge.to_origin.pop().unwrap();
        assert_eq!(confirm.message.kind, MessageKind::WithdrawConfirm);
        for _ in 0..3 {
            bridge
                .sender
                .handle(over_the_wire(confirm.clone()), 0)
                .await
                .unwrap();
        }

        assert_eq!(bridge.sender.escrow().total_released, UNIT);
        assert_eq!(bridge.sender.escrow().balance, 0);
        assert_eq!(bridge.sender.user_account(&alice).total_withdrawn, UNIT);
        bridge.assert_invariants();
    }

    #[tokio::test]
    async fn test_withdraw_overtaking_deposit_is_rejected_and_unlocked() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        let id = bridge.sender.withdraw(&alice, UNIT, 0).await.unwrap();

        // Reverse the queue so the request lands first
        let mut queued = bridge.to_dest.drain();
        queued.reverse();
        let mut outcomes = Vec::new();
        for envelope in queued {
            outcomes.push(
                bridge
                    .receiver
                    .handle(over_the_wire(envelope), 0)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            outcomes,
            vec![
                Outcome::Rejected(RejectReason::InsufficientBalance),
                Outcome::Applied
            ]
        );

        bridge.settle(0).await;
        assert_eq!(
            bridge.sender.withdrawal(&id).unwrap().status,
            WithdrawalStatus::Rejected
        );
        let account = bridge.sender.user_account(&alice);
        assert_eq!(account.locked_for_withdrawal, 0);
        assert_eq!(account.principal, UNIT);
        assert_eq!(bridge.receiver.pool().user_deposit(&alice), UNIT);
    }
}

// ============================================================================
// Yield
// ============================================================================

mod yield_accrual {
    use super::*;

    #[tokio::test]
    async fn test_one_period_at_500_bps_yields_five_percent() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;

        assert_eq!(bridge.receiver.sync_yield(PERIOD).await.unwrap(), 1);
        bridge.settle(PERIOD).await;

        assert_eq!(bridge.sender.get_user_total_yield(&alice), 50_000);
        assert_eq!(bridge.sender.get_user_balance(&alice), 1_050_000);
        assert_eq!(
            bridge.receiver.user_account(&alice, PERIOD).accrued_yield,
            50_000
        );
    }

    #[tokio::test]
    async fn test_insufficient_liquidity_rejects_and_leaves_pool_untouched() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;
        bridge.receiver.sync_yield(PERIOD).await.unwrap();
        bridge.settle(PERIOD).await;
        let pool_before = bridge.receiver.pool().state().clone();

        let id = bridge
            .sender
            .withdraw(&alice, 1_050_000, PERIOD)
            .await
            .unwrap();
        assert_eq!(
            bridge.deliver_to_receiver(PERIOD).await,
            vec![Outcome::Rejected(RejectReason::InsufficientLiquidity)]
        );
        assert_eq!(bridge.receiver.pool().state(), &pool_before);

        let reply = bridge.to_origin.pop().unwrap();
        assert_eq!(reply.message.kind, MessageKind::WithdrawReject);
        bridge.sender.handle(over_the_wire(reply), PERIOD).await.unwrap();

        assert_eq!(
            bridge.sender.withdrawal(&id).unwrap().status,
            WithdrawalStatus::Rejected
        );
        assert_eq!(bridge.sender.get_user_balance(&alice), 1_050_000);
        assert_eq!(bridge.sender.user_account(&alice).locked_for_withdrawal, 0);
        bridge.assert_invariants();
    }

    #[tokio::test]
    async fn test_sync_dropped_during_rejected_withdrawal_is_resent() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;
        bridge.receiver.sync_yield(PERIOD).await.unwrap();
        bridge.settle(PERIOD).await;

        let id = bridge
            .sender
            .withdraw(&alice, 1_050_000, PERIOD)
            .await
            .unwrap();
        // the next period's sync reaches the origin while the request is in flight
        assert_eq!(bridge.receiver.sync_yield(2 * PERIOD).await.unwrap(), 1);
        bridge.deliver_to_sender(2 * PERIOD).await;
        assert_eq!(bridge.sender.get_user_total_yield(&alice), 50_000);

        assert_eq!(
            bridge.deliver_to_receiver(2 * PERIOD).await,
            vec![Outcome::Rejected(RejectReason::InsufficientLiquidity)]
        );
        bridge.settle(2 * PERIOD).await;
        assert_eq!(
            bridge.sender.withdrawal(&id).unwrap().status,
            WithdrawalStatus::Rejected
        );

        assert_eq!(bridge.receiver.sync_yield(2 * PERIOD + 10).await.unwrap(), 1);
        bridge.settle(2 * PERIOD + 10).await;
        assert_eq!(bridge.sender.get_user_total_yield(&alice), 100_000);
        assert_eq!(
            bridge.receiver.user_account(&alice, 2 * PERIOD + 10).accrued_yield,
            100_000
        );
        bridge.assert_invariants();
    }

    #[tokio::test]
    async fn test_reserve_pays_yield_on_full_withdrawal() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge
            .receiver
            .add_liquidity(&addr("pool-owner"), UNIT)
            .unwrap();
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;
        bridge.receiver.sync_yield(PERIOD).await.unwrap();
        bridge.settle(PERIOD).await;

        let id = bridge
            .sender
            .withdraw(&alice, 1_050_000, PERIOD)
            .await
            .unwrap();
        bridge.settle(PERIOD).await;

        assert_eq!(
            bridge.sender.withdrawal(&id).unwrap().status,
            WithdrawalStatus::Confirmed
        );
        assert_eq!(bridge.sender.get_user_balance(&alice), 0);
        assert_eq!(bridge.sender.escrow().total_yield_received, 50_000);
        let stats = bridge.receiver.pool_stats();
        assert_eq!(stats.total_yield_paid, 50_000);
        assert_eq!(stats.liquidity, UNIT - 50_000);
    }
}

// ============================================================================
// Failure and recovery
// ============================================================================

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_timeout_stuck_retry_gets_duplicate_reply() {
        let mut bridge = Bridge::new();
        let alice = addr("alice");
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.settle(0).await;

        let id = bridge.sender.withdraw(&alice, UNIT, 10).await.unwrap();
        bridge.deliver_to_receiver(10).await;
        let lost = bridge.to_origin.drain();
        assert_eq!(lost.len(), 1);

        let stuck = bridge.sender.expire_pending(10 + TIMEOUT).unwrap();
        assert_eq!(stuck, vec![id]);
        assert_eq!(bridge.sender.stuck_withdrawals()[0].id, id);
        assert_eq!(bridge.sender.user_account(&alice).locked_for_withdrawal, UNIT);

        bridge
            .sender
            .retry_withdrawal(&id, 20 + TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            bridge.deliver_to_receiver(20 + TIMEOUT).await,
            vec![Outcome::Duplicate]
        );

        let resent = bridge.to_origin.pop().unwrap();
        assert_eq!(resent.message, lost[0].message);
        bridge
            .sender
            .handle(over_the_wire(resent), 20 + TIMEOUT)
            .await
            .unwrap();

        assert_eq!(
            bridge.sender.withdrawal(&id).unwrap().status,
            WithdrawalStatus::Confirmed
        );
        assert_eq!(bridge.receiver.pool_stats().total_withdrawn, UNIT);
        assert_eq!(bridge.sender.escrow().total_released, UNIT);
        bridge.assert_invariants();
    }

    #[tokio::test]
    async fn test_halted_receiver_rejects_everything() {
        let to_dest = Arc::new(QueueChannel::new());
        let to_origin = Arc::new(QueueChannel::new());
        let mut sender = Sender::new(sender_config(), to_dest.clone()).unwrap();
        let mut wrong = receiver_config();
        wrong.lending_pool = addr("another-pool");
        let mut receiver = Receiver::new(
            wrong,
            YieldPool::new(pool_config()).unwrap(),
            to_origin.clone(),
        );
        assert!(receiver.is_halted());

        let alice = addr("alice");
        sender.deposit(&alice, UNIT, 0).await.unwrap();
        sender.withdraw(&alice, UNIT, 0).await.unwrap();
        for envelope in to_dest.drain() {
            let err = receiver.handle(envelope, 0).await.unwrap_err();
            assert!(matches!(err, BridgeError::GatewayHalted { .. }));
        }
        assert!(matches!(
            receiver.sync_yield(PERIOD).await,
            Err(BridgeError::GatewayHalted { .. })
        ));
        assert_eq!(receiver.processed_count(), 0);
        assert!(to_origin.is_empty());
    }

    #[tokio::test]
    async fn test_verify_peer_detects_miswired_sender() {
        let mut bridge = Bridge::new();
        bridge
            .receiver
            .verify_peer(
                bridge.sender.address(),
                bridge.sender.receiver_contract(),
            )
            .unwrap();
        assert!(!bridge.receiver.is_halted());

        let err = bridge
            .receiver
            .verify_peer(&addr("rogue-sender"), &addr("receiver"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigMismatch { .. }));
        assert!(bridge.receiver.is_halted());
    }

    #[tokio::test]
    async fn test_restart_resumes_in_flight_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(FileStore::new(dir.path()).unwrap());
        let alice = addr("alice");

        let mut bridge = Bridge::with_store(store.clone());
        let deposit_id = bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.deliver_to_receiver(0).await;
        // Receiver's ack never reaches the sender, then the withdrawal is lost too
        bridge.to_origin.drain();
        let withdraw_id = bridge.sender.withdraw(&alice, UNIT, 5).await.unwrap();
        bridge.to_dest.drain();
        let sender_before = bridge.sender.snapshot();
        let receiver_before = bridge.receiver.snapshot();
        drop(bridge);

        let mut bridge = Bridge::reload(store);
        assert_eq!(bridge.sender.snapshot(), sender_before);
        assert_eq!(bridge.receiver.snapshot(), receiver_before);

        assert_eq!(bridge.sender.resume(100).await.unwrap(), 2);
        bridge.settle(100).await;

        assert!(bridge
            .sender
            .deposit_record(&deposit_id)
            .unwrap()
            .acknowledged);
        assert_eq!(
            bridge.sender.withdrawal(&withdraw_id).unwrap().status,
            WithdrawalStatus::Confirmed
        );
        assert_eq!(bridge.receiver.pool_stats().total_deposits, UNIT);
        assert_eq!(bridge.receiver.pool_stats().total_withdrawn, UNIT);
    }

    #[tokio::test]
    async fn test_outbox_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(FileStore::new(dir.path()).unwrap());
        let alice = addr("alice");

        let mut bridge = Bridge::with_store(store.clone());
        bridge.sender.deposit(&alice, UNIT, 0).await.unwrap();
        bridge.to_origin.fail_next_sends(1);
        bridge.deliver_to_receiver(0).await;
        assert_eq!(bridge.receiver.pending_replies(), 1);
        drop(bridge);

        let mut bridge = Bridge::reload(store);
        assert_eq!(bridge.receiver.pending_replies(), 1);
        assert_eq!(bridge.receiver.flush_outbox().await.unwrap(), 1);
        assert_eq!(bridge.deliver_to_sender(0).await, vec![Outcome::Applied]);
        assert_eq!(bridge.receiver.pending_replies(), 0);
    }
}
