//! Prometheus metrics for the perpx engine.
//!
//! Covers:
//! - Intent intake (accepted, rejected by reason, duplicates)
//! - Operation terminal outcomes and confirmation latency
//! - Submissions and replacement broadcasts
//! - Gateway timeouts
//! - Open positions and liquidation-risk flags
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

/// Intents accepted into the engine.
/// Labels: market, kind (open/increase/decrease/close)
pub static INTENTS_ACCEPTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_intents_accepted_total",
        "Total intents that passed risk validation",
        &["market", "kind"]
    )
    .unwrap()
});

/// Intents rejected before any chain interaction.
/// Labels: reason (RejectReason label)
pub static INTENTS_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_intents_rejected_total",
        "Total intents rejected by risk validation",
        &["reason"]
    )
    .unwrap()
});

/// Intents answered from an existing operation via idempotency key.
pub static INTENTS_DUPLICATE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_intents_duplicate_total",
        "Total intents answered with an existing operation",
        &["status"]
    )
    .unwrap()
});

/// Operations reaching a terminal status.
/// Labels: status (confirmed/failed/cancelled), reason (failure kind or "none")
pub static OPERATIONS_TERMINAL_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_operations_terminal_total",
        "Total operations reaching a terminal status",
        &["status", "reason"]
    )
    .unwrap()
});

/// Broadcasts accepted by the node.
/// Labels: cause (initial/fee_bump/nonce_conflict/cancel)
pub static SUBMISSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_submissions_total",
        "Total transactions broadcast",
        &["cause"]
    )
    .unwrap()
});

/// Time from first broadcast to confirmation in milliseconds.
pub static CONFIRMATION_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "perpx_confirmation_latency_ms",
        "Latency from first broadcast to confirmation in milliseconds",
        &["market"],
        vec![250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0, 60000.0, 120000.0]
    )
    .unwrap()
});

/// Gateway calls that hit their timeout.
/// Labels: call (get_nonce/estimate_fee/submit/get_receipt/...)
pub static GATEWAY_TIMEOUTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_gateway_timeouts_total",
        "Total gateway calls that timed out",
        &["call"]
    )
    .unwrap()
});

/// Open positions held by the account.
pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("perpx_open_positions", "Number of open positions").unwrap()
});

/// Operations not yet terminal.
pub static OPERATIONS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "perpx_operations_in_flight",
        "Number of operations not yet in a terminal status"
    )
    .unwrap()
});

/// Positions flagged by the liquidation scan.
/// Labels: market, risk (below_min_collateral/past_liquidation_price)
pub static LIQUIDATION_RISK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "perpx_liquidation_risk_total",
        "Total liquidation-risk flags raised by the position scan",
        &["market", "risk"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    pub fn intent_accepted(market: &str, kind: &str) {
        INTENTS_ACCEPTED_TOTAL
            .with_label_values(&[market, kind])
            .inc();
    }

    pub fn intent_rejected(reason: &str) {
        INTENTS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn intent_duplicate(status: &str) {
        INTENTS_DUPLICATE_TOTAL.with_label_values(&[status]).inc();
    }

    /// Record a terminal status. `reason` is `"none"` for non-failures.
    pub fn operation_terminal(status: &str, reason: &str) {
        OPERATIONS_TERMINAL_TOTAL
            .with_label_values(&[status, reason])
            .inc();
    }

    pub fn submission(cause: &str) {
        SUBMISSIONS_TOTAL.with_label_values(&[cause]).inc();
    }

    pub fn confirmation_latency(market: &str, latency_ms: f64) {
        CONFIRMATION_LATENCY_MS
            .with_label_values(&[market])
            .observe(latency_ms);
    }

    pub fn gateway_timeout(call: &str) {
        GATEWAY_TIMEOUTS_TOTAL.with_label_values(&[call]).inc();
    }

    pub fn open_positions_set(count: i64) {
        OPEN_POSITIONS.set(count);
    }

    pub fn in_flight_inc() {
        OPERATIONS_IN_FLIGHT.inc();
    }

    pub fn in_flight_dec() {
        OPERATIONS_IN_FLIGHT.dec();
    }

    pub fn liquidation_risk(market: &str, risk: &str) {
        LIQUIDATION_RISK_TOTAL
            .with_label_values(&[market, risk])
            .inc();
    }
}
