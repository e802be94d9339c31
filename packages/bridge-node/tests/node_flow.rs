//! End-to-end node scenarios: both gateways, the relay and persistence

use bridge_node::config::{ApiConfig, RelayConfig};
use bridge_node::{bootstrap, metrics, NodeConfig};
use yield_bridge::{
    Address, DomainId, PoolConfig, ReceiverConfig, SenderConfig, WithdrawalStatus, UNIT,
};

const YEAR: u64 = 365 * 24 * 60 * 60;
const TIMEOUT: u64 = 900;

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

fn config(state_dir: Option<std::path::PathBuf>, initial_liquidity: u128) -> NodeConfig {
    NodeConfig {
        sender: SenderConfig {
            address: addr("origin-gateway"),
            owner: addr("origin-owner"),
            domain: DomainId::Origin,
            dest_domain: DomainId::Destination,
            receiver_address: addr("destination-gateway"),
            withdraw_timeout_secs: TIMEOUT,
        },
        receiver: ReceiverConfig {
            address: addr("destination-gateway"),
            owner: addr("destination-owner"),
            domain: DomainId::Destination,
            origin_domain: DomainId::Origin,
            sender_address: addr("origin-gateway"),
            lending_pool: addr("lending-pool"),
        },
        pool: PoolConfig {
            address: addr("lending-pool"),
            owner: addr("pool-owner"),
            yield_rate_bps: 500,
            accrual_period_secs: YEAR,
        },
        pool_initial_liquidity: initial_liquidity,
        relay: RelayConfig {
            poll_interval_ms: 10,
            yield_sync_interval_ms: 10,
            circuit_breaker_threshold: 3,
            circuit_breaker_pause_ms: 10,
        },
        api: ApiConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
        },
        state_dir,
    }
}

#[tokio::test]
async fn test_yield_withdrawal_without_reserve_is_rejected() {
    let (gateways, mut relay) = bootstrap(&config(None, 0)).unwrap();
    let alice = addr("alice");

    gateways
        .sender
        .lock()
        .await
        .deposit(&alice, 100 * UNIT, 0)
        .await
        .unwrap();
    relay.pump(0).await;
    relay.sync_yield(YEAR).await;
    relay.pump(YEAR).await;

    // yield was accrued but nobody funded it
    let id = gateways
        .sender
        .lock()
        .await
        .withdraw(&alice, 105 * UNIT, YEAR)
        .await
        .unwrap();
    relay.pump(YEAR).await;

    let sender = gateways.sender.lock().await;
    assert_eq!(sender.withdrawal(&id).unwrap().status, WithdrawalStatus::Rejected);
    assert_eq!(sender.get_user_balance(&alice), 105 * UNIT);
    assert_eq!(sender.user_account(&alice).locked_for_withdrawal, 0);
    drop(sender);

    let stats = gateways.receiver.lock().await.pool_stats();
    assert_eq!(stats.total_deposits, 100 * UNIT);
    assert_eq!(stats.total_withdrawn, 0);
    assert_eq!(stats.liquidity, 100 * UNIT);
}

#[tokio::test]
async fn test_stuck_withdrawal_survives_restart_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let node = config(Some(dir.path().to_path_buf()), 0);
    let bob = addr("bob");

    let id = {
        let (gateways, mut relay) = bootstrap(&node).unwrap();
        gateways
            .sender
            .lock()
            .await
            .deposit(&bob, 50 * UNIT, 0)
            .await
            .unwrap();
        relay.pump(0).await;

        let id = gateways
            .sender
            .lock()
            .await
            .withdraw(&bob, 20 * UNIT, 100)
            .await
            .unwrap();
        // the node goes down before the request is relayed
        id
    };

    let (gateways, mut relay) = bootstrap(&node).unwrap();
    relay.maintain(100 + TIMEOUT).await;
    assert_eq!(
        gateways.sender.lock().await.withdrawal(&id).unwrap().status,
        WithdrawalStatus::Stuck
    );

    gateways
        .sender
        .lock()
        .await
        .retry_withdrawal(&id, 200 + TIMEOUT)
        .await
        .unwrap();
    relay.pump(200 + TIMEOUT).await;

    let sender = gateways.sender.lock().await;
    let withdrawal = sender.withdrawal(&id).unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Confirmed);
    assert_eq!(sender.get_user_balance(&bob), 30 * UNIT);
    sender.check_invariants().unwrap();
    drop(sender);

    let receiver = gateways.receiver.lock().await;
    assert_eq!(receiver.pool_stats().total_withdrawn, 20 * UNIT);
    receiver.check_invariants().unwrap();
}

#[tokio::test]
async fn test_resume_resends_in_flight_messages() {
    let dir = tempfile::tempdir().unwrap();
    let node = config(Some(dir.path().to_path_buf()), 0);
    let carol = addr("carol");

    {
        let (gateways, _relay) = bootstrap(&node).unwrap();
        gateways
            .sender
            .lock()
            .await
            .deposit(&carol, 7 * UNIT, 0)
            .await
            .unwrap();
    }

    let (gateways, mut relay) = bootstrap(&node).unwrap();
    assert_eq!(relay.resume(10).await, 1);
    relay.pump(10).await;

    let receiver = gateways.receiver.lock().await;
    assert_eq!(receiver.pool_stats().total_deposits, 7 * UNIT);
    assert_eq!(receiver.processed_count(), 1);
}

#[tokio::test]
async fn test_gauges_exported() {
    let (gateways, mut relay) = bootstrap(&config(None, 10 * UNIT)).unwrap();
    gateways
        .sender
        .lock()
        .await
        .deposit(&addr("dave"), 3 * UNIT, 0)
        .await
        .unwrap();
    relay.pump(0).await;

    gateways.export_gauges().await;
    let (_, body) = metrics::encode().unwrap();
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("yield_bridge_pool"));
    assert!(text.contains("yield_bridge_escrow_balance"));
}
