use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::LazyLock;

/// `/mint` outcomes, labelled by [`ApiError::label`](crate::error::ApiError::label)
/// or `minted`.
pub static MINT_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_mint_requests_total",
        "Mint requests by outcome",
        &["result"]
    )
    .unwrap()
});

pub static SETTLE_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "x402_mint_settle_duration_seconds",
        "Time from accepted claim to response, in seconds",
        &["result"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap()
});

pub static CHAIN_SUBMISSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_mint_chain_submissions_total",
        "Relayer transaction submissions",
        &["purpose", "result"]
    )
    .unwrap()
});

pub static CONFIRMATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_mint_confirmations_total",
        "Outcomes of waiting on relayer transactions",
        &["result"]
    )
    .unwrap()
});

pub static RELAYER_BALANCE_GWEI: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "x402_mint_relayer_balance_gwei",
        "Relayer gas balance in gwei, as of the last health check"
    )
    .unwrap()
});

pub static ADMIN_AUTH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_mint_admin_auth_failures_total",
        "Rejected admin requests",
        &["reason"]
    )
    .unwrap()
});

pub static TELEMETRY_DELIVERIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "x402_mint_telemetry_deliveries_total",
        "Telemetry POST outcomes",
        &["result"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
