//! Relay loop carrying messages between the two gateways
//!
//! Both gateways live in this process. Each writes into its own
//! [`MpscChannel`]; the relay drains those channels, hands every envelope to
//! the peer gateway and runs the periodic recovery work:
//! - timing out unanswered withdrawals
//! - replaying unacknowledged deposits
//! - flushing receiver replies the channel refused
//! - pushing yield syncs to the origin

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use yield_bridge::{
    classify_error, with_retry, BridgeError, Envelope, ErrorClass, FileStore, MpscChannel,
    Outcome, Receiver, RetryPolicy, Sender, SnapshotStore, YieldPool,
};

use crate::config::NodeConfig;
use crate::metrics;

pub type SharedSender = Arc<Mutex<Sender>>;
pub type SharedReceiver = Arc<Mutex<Receiver>>;

/// Both gateways, shared between the relay and the API
#[derive(Clone)]
pub struct Gateways {
    pub sender: SharedSender,
    pub receiver: SharedReceiver,
}

impl Gateways {
    /// Refresh every state gauge from the gateways
    pub async fn export_gauges(&self) {
        let mut gauges = metrics::GatewayGauges::default();
        {
            let sender = self.sender.lock().await;
            gauges.stuck_withdrawals = sender.stuck_withdrawals().len();
            gauges.in_flight_withdrawals = sender.in_flight_withdrawals();
            gauges.escrow_balance = sender.escrow().balance;
        }
        {
            let receiver = self.receiver.lock().await;
            gauges.pending_replies = receiver.pending_replies();
            gauges.receiver_halted = receiver.is_halted();
            gauges.pool = receiver.pool_stats();
        }
        metrics::update_gauges(&gauges);
    }
}

/// Circuit breaker configuration for the relay
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    /// How long to pause when circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Origin sender to destination receiver
    ToDestination,
    /// Destination receiver to origin sender
    ToOrigin,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToDestination => "to_destination",
            Direction::ToOrigin => "to_origin",
        }
    }

    fn gateway(&self) -> &'static str {
        match self {
            Direction::ToDestination => "receiver",
            Direction::ToOrigin => "sender",
        }
    }
}

pub struct Relay {
    gateways: Gateways,
    to_destination: mpsc::UnboundedReceiver<Envelope>,
    to_origin: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes whose handling failed transiently
    retry_queue: VecDeque<(Direction, Envelope)>,
    retry_policy: RetryPolicy,
    circuit_breaker: CircuitBreakerConfig,
    poll_interval: Duration,
    yield_sync_interval: Duration,
    consecutive_failures: u32,
}

/// Build both gateways from configuration, restoring snapshots when present
pub fn bootstrap(config: &NodeConfig) -> Result<(Gateways, Relay)> {
    let store: Option<Arc<dyn SnapshotStore>> = match &config.state_dir {
        Some(dir) => {
            let store = FileStore::new(dir)?;
            info!(dir = %store.dir().display(), "Using file snapshot store");
            let store: Arc<dyn SnapshotStore> = Arc::new(store);
            Some(store)
        }
        None => {
            warn!("STATE_DIR not set, state will not survive a restart");
            None
        }
    };

    let (destination_channel, to_destination) = MpscChannel::new();
    let (origin_channel, to_origin) = MpscChannel::new();

    let restored_sender = match &store {
        Some(store) => Sender::load(store.clone(), Arc::new(destination_channel.clone()))?,
        None => None,
    };
    let sender = match restored_sender {
        Some(sender) => {
            if sender.config() != &config.sender {
                warn!("Persisted sender configuration differs from environment, keeping persisted");
            }
            sender
        }
        None => {
            let sender = Sender::new(config.sender.clone(), Arc::new(destination_channel))?;
            match &store {
                Some(store) => sender.with_store(store.clone()),
                None => sender,
            }
        }
    };

    let restored_receiver = match &store {
        Some(store) => Receiver::load(store.clone(), Arc::new(origin_channel.clone()))?,
        None => None,
    };
    let mut receiver = match restored_receiver {
        Some(mut receiver) => {
            if receiver.config() != &config.receiver {
                if let Err(e) = receiver.reconfigure(config.receiver.clone()) {
                    error!(error = %e, "Environment receiver configuration rejected");
                }
            }
            receiver
        }
        None => {
            let mut pool = YieldPool::new(config.pool.clone())?;
            if config.pool_initial_liquidity > 0 {
                pool.add_liquidity(&config.pool.owner, config.pool_initial_liquidity)?;
                info!(
                    amount = config.pool_initial_liquidity,
                    "Seeded pool reserve"
                );
            }
            let receiver =
                Receiver::new(config.receiver.clone(), pool, Arc::new(origin_channel));
            let receiver = match &store {
                Some(store) => receiver.with_store(store.clone()),
                None => receiver,
            };
            receiver.persist()?;
            sender.persist()?;
            receiver
        }
    };

    if let Err(e) = receiver.verify_peer(sender.address(), sender.receiver_contract()) {
        error!(error = %e, "Receiver does not match its sender, refusing to process messages");
    }

    let gateways = Gateways {
        sender: Arc::new(Mutex::new(sender)),
        receiver: Arc::new(Mutex::new(receiver)),
    };

    let relay = Relay {
        gateways: gateways.clone(),
        to_destination,
        to_origin,
        retry_queue: VecDeque::new(),
        retry_policy: RetryPolicy::default(),
        circuit_breaker: CircuitBreakerConfig {
            threshold: config.relay.circuit_breaker_threshold,
            pause_duration: config.relay.circuit_breaker_pause(),
        },
        poll_interval: config.relay.poll_interval(),
        yield_sync_interval: config.relay.yield_sync_interval(),
        consecutive_failures: 0,
    };

    Ok((gateways, relay))
}

impl Relay {
    pub fn queued_retries(&self) -> usize {
        self.retry_queue.len()
    }

    /// Run until a shutdown signal arrives
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            yield_sync_interval_ms = self.yield_sync_interval.as_millis() as u64,
            "Relay starting"
        );

        let resent = self.resume(crate::now_unix()).await;
        if resent > 0 {
            info!(resent = resent, "Re-sent in-flight messages after restart");
        }

        let mut poll = tokio::time::interval(self.poll_interval);
        let mut yield_sync = tokio::time::interval(self.yield_sync_interval);
        let mut heartbeat = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Relay shutting down");
                    self.persist_all().await;
                    return Ok(());
                }
                Some(envelope) = self.to_destination.recv() => {
                    self.dispatch(Direction::ToDestination, envelope, crate::now_unix()).await;
                }
                Some(envelope) = self.to_origin.recv() => {
                    self.dispatch(Direction::ToOrigin, envelope, crate::now_unix()).await;
                }
                _ = poll.tick() => {
                    let now = crate::now_unix();
                    self.retry_failed(now).await;
                    self.maintain(now).await;
                }
                _ = yield_sync.tick() => {
                    self.sync_yield(crate::now_unix()).await;
                }
                _ = heartbeat.tick() => {
                    let sender = self.gateways.sender.lock().await;
                    let nonce = sender.nonce();
                    let in_flight = sender.in_flight_withdrawals();
                    drop(sender);
                    let receiver = self.gateways.receiver.lock().await;
                    info!(
                        sender_nonce = nonce,
                        in_flight_withdrawals = in_flight,
                        processed = receiver.processed_count(),
                        pending_replies = receiver.pending_replies(),
                        halted = receiver.is_halted(),
                        consecutive_failures = self.consecutive_failures,
                        queued_retries = self.retry_queue.len(),
                        "Relay heartbeat"
                    );
                }
            }
        }
    }

    /// Re-send everything the sender still has in flight
    pub async fn resume(&mut self, now: u64) -> usize {
        let mut sender = self.gateways.sender.lock().await;
        match sender.resume(now).await {
            Ok(count) => count,
            Err(e) => {
                metrics::record_error("sender", &e);
                error!(error = %e, "Failed to resume sender");
                0
            }
        }
    }

    /// Deliver every envelope currently queued in either direction
    ///
    /// Returns the number of envelopes handled. Replies produced while
    /// handling are picked up by the same call.
    pub async fn pump(&mut self, now: u64) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(envelope) = self.to_destination.try_recv() {
                self.dispatch(Direction::ToDestination, envelope, now).await;
                handled += 1;
                continue;
            }
            if let Ok(envelope) = self.to_origin.try_recv() {
                self.dispatch(Direction::ToOrigin, envelope, now).await;
                handled += 1;
                continue;
            }
            return handled;
        }
    }

    async fn deliver(
        &self,
        direction: Direction,
        envelope: Envelope,
        now: u64,
    ) -> std::result::Result<Outcome, BridgeError> {
        match direction {
            Direction::ToDestination => {
                self.gateways.receiver.lock().await.handle(envelope, now).await
            }
            Direction::ToOrigin => self.gateways.sender.lock().await.handle(envelope, now).await,
        }
    }

    async fn dispatch(&mut self, direction: Direction, envelope: Envelope, now: u64) {
        let kind = envelope.message.kind.as_str();
        let id = envelope.message.id;
        metrics::record_relayed(direction.as_str(), kind);

        match self.deliver(direction, envelope.clone(), now).await {
            Ok(outcome) => {
                metrics::record_outcome(direction.gateway(), kind, &outcome);
                debug!(
                    direction = direction.as_str(),
                    kind = kind,
                    id = %id,
                    outcome = outcome.as_str(),
                    "Message handled"
                );
            }
            Err(e) => {
                metrics::record_error(direction.gateway(), &e);
                match classify_error(&e) {
                    ErrorClass::Transient => {
                        warn!(
                            direction = direction.as_str(),
                            id = %id,
                            error = %e,
                            "Message handling failed, queued for retry"
                        );
                        self.retry_queue.push_back((direction, envelope));
                    }
                    ErrorClass::Permanent => {
                        warn!(
                            direction = direction.as_str(),
                            kind = kind,
                            id = %id,
                            error = %e,
                            "Message refused, dropping"
                        );
                    }
                    ErrorClass::Fatal => {
                        error!(
                            direction = direction.as_str(),
                            id = %id,
                            error = %e,
                            "Gateway halted, message dropped until reconfigured"
                        );
                    }
                }
            }
        }
    }

    /// Re-deliver envelopes that failed transiently
    pub async fn retry_failed(&mut self, now: u64) {
        if self.retry_queue.is_empty() {
            return;
        }

        if self.consecutive_failures >= self.circuit_breaker.threshold {
            warn!(
                failures = self.consecutive_failures,
                pause_secs = self.circuit_breaker.pause_duration.as_secs(),
                "Relay circuit breaker tripped, pausing"
            );
            tokio::time::sleep(self.circuit_breaker.pause_duration).await;
            self.consecutive_failures = 0;
        }

        let batch: Vec<(Direction, Envelope)> = self.retry_queue.drain(..).collect();
        let mut failed = false;
        for (direction, envelope) in batch {
            let id = envelope.message.id;
            match self.deliver(direction, envelope.clone(), now).await {
                Ok(outcome) => {
                    metrics::record_outcome(
                        direction.gateway(),
                        envelope.message.kind.as_str(),
                        &outcome,
                    );
                }
                Err(e) if classify_error(&e) == ErrorClass::Transient => {
                    metrics::record_error(direction.gateway(), &e);
                    warn!(id = %id, error = %e, "Retry failed");
                    self.retry_queue.push_back((direction, envelope));
                    failed = true;
                }
                Err(e) => {
                    metrics::record_error(direction.gateway(), &e);
                    warn!(id = %id, error = %e, "Retry refused, dropping");
                }
            }
        }

        if failed {
            self.consecutive_failures += 1;
            let backoff = self.retry_policy.backoff_for_attempt(self.consecutive_failures);
            error!(
                consecutive_failures = self.consecutive_failures,
                next_backoff_secs = backoff.as_secs(),
                "Error re-delivering messages, will retry with backoff"
            );
            metrics::set_consecutive_failures(self.consecutive_failures);
            tokio::time::sleep(backoff).await;
        } else {
            self.consecutive_failures = 0;
            metrics::set_consecutive_failures(0);
        }
    }

    /// Periodic recovery work
    pub async fn maintain(&mut self, now: u64) {
        {
            let mut sender = self.gateways.sender.lock().await;
            match sender.expire_pending(now) {
                Ok(stuck) => {
                    for id in stuck {
                        warn!(id = %id, "Withdrawal timed out, awaiting manual retry");
                    }
                }
                Err(e) => {
                    metrics::record_error("sender", &e);
                    error!(error = %e, "Failed to expire pending withdrawals");
                }
            }
            if let Err(e) = sender.replay_unacknowledged(now).await {
                metrics::record_error("sender", &e);
                error!(error = %e, "Failed to replay unacknowledged deposits");
            }
        }

        {
            let mut receiver = self.gateways.receiver.lock().await;
            if !receiver.is_halted() {
                if let Err(e) = receiver.flush_outbox().await {
                    metrics::record_error("receiver", &e);
                    error!(error = %e, "Failed to flush receiver outbox");
                }
            }
        }

        self.gateways.export_gauges().await;
    }

    /// Push changed yield figures to the origin
    pub async fn sync_yield(&mut self, now: u64) {
        let mut receiver = self.gateways.receiver.lock().await;
        if receiver.is_halted() {
            return;
        }
        match receiver.sync_yield(now).await {
            Ok(0) => {}
            Ok(sent) => debug!(sent = sent, "Yield sync queued"),
            Err(e) => {
                metrics::record_error("receiver", &e);
                error!(error = %e, "Yield sync failed");
            }
        }
    }

    /// Write both snapshots, retrying storage failures with backoff
    async fn persist_all(&self) {
        let sender = self.gateways.sender.clone();
        let result = with_retry(&self.retry_policy, |_| {
            let sender = sender.clone();
            async move {
                let result = sender.lock().await.persist();
                result
            }
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "Failed to persist sender on shutdown");
        }

        let receiver = self.gateways.receiver.clone();
        let result = with_retry(&self.retry_policy, |_| {
            let receiver = receiver.clone();
            async move {
                let result = receiver.lock().await.persist();
                result
            }
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "Failed to persist receiver on shutdown");
        }
    }
}
