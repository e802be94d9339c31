//! Prometheus metrics for the yield bridge node
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};

use yield_bridge::{BridgeError, ErrorCategory, Outcome, PoolStats};

lazy_static! {
    // Message flow
    pub static ref MESSAGES_RELAYED: CounterVec = register_counter_vec!(
        "yield_bridge_messages_relayed_total",
        "Messages carried between the gateways",
        &["direction", "kind"]
    ).unwrap();

    pub static ref MESSAGES_HANDLED: CounterVec = register_counter_vec!(
        "yield_bridge_messages_handled_total",
        "Delivered messages by handling outcome",
        &["gateway", "kind", "outcome"]
    ).unwrap();

    pub static ref DELIVERY_FAILURES: CounterVec = register_counter_vec!(
        "yield_bridge_delivery_failures_total",
        "Channel hand-offs that failed",
        &["gateway"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "yield_bridge_errors_total",
        "Total number of errors",
        &["gateway", "category"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: Gauge = register_gauge!(
        "yield_bridge_consecutive_failures",
        "Number of consecutive relay failures (circuit breaker)"
    ).unwrap();

    // Ledger state
    pub static ref STUCK_WITHDRAWALS: Gauge = register_gauge!(
        "yield_bridge_stuck_withdrawals",
        "Withdrawals waiting for a manual retry"
    ).unwrap();

    pub static ref IN_FLIGHT_WITHDRAWALS: Gauge = register_gauge!(
        "yield_bridge_in_flight_withdrawals",
        "Withdrawals awaiting a reply"
    ).unwrap();

    pub static ref PENDING_REPLIES: Gauge = register_gauge!(
        "yield_bridge_pending_replies",
        "Receiver replies not yet accepted by the channel"
    ).unwrap();

    pub static ref POOL: GaugeVec = register_gauge_vec!(
        "yield_bridge_pool",
        "Lending pool totals in minor units",
        &["field"]
    ).unwrap();

    pub static ref ESCROW_BALANCE: Gauge = register_gauge!(
        "yield_bridge_escrow_balance",
        "Funds held by the origin escrow in minor units"
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "yield_bridge_up",
        "Whether the node is up and running"
    ).unwrap();

    pub static ref RECEIVER_HALTED: Gauge = register_gauge!(
        "yield_bridge_receiver_halted",
        "1 while the receiver refuses to process messages"
    ).unwrap();
}

/// Record a message handed from one gateway's channel to the other gateway
pub fn record_relayed(direction: &str, kind: &str) {
    MESSAGES_RELAYED.with_label_values(&[direction, kind]).inc();
}

/// Record the outcome of a handled message
pub fn record_outcome(gateway: &str, kind: &str, outcome: &Outcome) {
    MESSAGES_HANDLED
        .with_label_values(&[gateway, kind, outcome.as_str()])
        .inc();
}

/// Record an error by category
pub fn record_error(gateway: &str, error: &BridgeError) {
    let category = match error.category() {
        ErrorCategory::Validation => "validation",
        ErrorCategory::Funds => "funds",
        ErrorCategory::Delivery => "delivery",
        ErrorCategory::Fatal => "fatal",
        ErrorCategory::Storage => "storage",
    };
    ERRORS.with_label_values(&[gateway, category]).inc();
    if matches!(error, BridgeError::MessageDeliveryFailure { .. }) {
        DELIVERY_FAILURES.with_label_values(&[gateway]).inc();
    }
}

/// Update consecutive failures
pub fn set_consecutive_failures(count: u32) {
    CONSECUTIVE_FAILURES.set(count as f64);
}

/// Snapshot of gateway state exported as gauges
#[derive(Debug, Clone, Default)]
pub struct GatewayGauges {
    pub stuck_withdrawals: usize,
    pub in_flight_withdrawals: usize,
    pub pending_replies: usize,
    pub escrow_balance: u128,
    pub receiver_halted: bool,
    pub pool: PoolStats,
}

/// Update every state gauge at once
pub fn update_gauges(gauges: &GatewayGauges) {
    STUCK_WITHDRAWALS.set(gauges.stuck_withdrawals as f64);
    IN_FLIGHT_WITHDRAWALS.set(gauges.in_flight_withdrawals as f64);
    PENDING_REPLIES.set(gauges.pending_replies as f64);
    ESCROW_BALANCE.set(gauges.escrow_balance as f64);
    RECEIVER_HALTED.set(if gauges.receiver_halted { 1.0 } else { 0.0 });

    let pool = &gauges.pool;
    for (field, value) in [
        ("total_deposits", pool.total_deposits),
        ("total_withdrawn", pool.total_withdrawn),
        ("total_yield_accrued", pool.total_yield_accrued),
        ("total_yield_paid", pool.total_yield_paid),
        ("outstanding_yield", pool.outstanding_yield),
        ("liquidity", pool.liquidity),
    ] {
        POOL.with_label_values(&[field]).set(value as f64);
    }
}

/// Set the up gauge
pub fn set_up(up: bool) {
    UP.set(if up { 1.0 } else { 0.0 });
}

/// Encode every registered metric in the Prometheus text format
///
/// Returns the content type alongside the body.
pub fn encode() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
