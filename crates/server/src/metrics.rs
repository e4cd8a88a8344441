//! Prometheus metrics for the trove daemon.
//!
//! Pool gauges mirror [`PoolStats`] and are refreshed from a fresh snapshot
//! on every scrape, so cumulative counts are exported as gauges rather than
//! incremented in parallel with the pool's own counters.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! It exposes pool saturation and the node's trust level, but no dataset
//! names or audit contents. Restrict it to scraper IPs at the network level.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};
use trove_core::ModeEnforcementResult;
use trove_metadata::PoolStats;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Pool saturation
pub static POOL_MAX_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_pool_max_connections",
        "Configured maximum number of pooled connections",
    )
    .expect("metric creation failed")
});

pub static POOL_CONNECTIONS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "trove_pool_connections",
            "Physical connections by state (total, idle)",
        ),
        &["state"],
    )
    .expect("metric creation failed")
});

pub static POOL_ACQUIRED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_pool_acquired_connections",
        "Role connections currently checked out",
    )
    .expect("metric creation failed")
});

pub static POOL_ACQUIRE_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_pool_acquire_count",
        "Role connections handed out since startup",
    )
    .expect("metric creation failed")
});

pub static POOL_WAIT_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_pool_wait_count",
        "Acquisitions that had to wait for a free connection",
    )
    .expect("metric creation failed")
});

pub static POOL_WAIT_SECONDS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "trove_pool_wait_seconds",
        "Cumulative time spent waiting for a free connection",
    )
    .expect("metric creation failed")
});

// Usage
pub static POOL_ROLE_INVOCATIONS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "trove_pool_role_invocations",
            "Role connections handed out since startup, by role",
        ),
        &["role"],
    )
    .expect("metric creation failed")
});

pub static POOL_TRANSACTIONS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "trove_pool_transactions",
            "Finished role transactions since startup, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static AUDIT_WRITE_FAILURES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_audit_write_failures",
        "Audit entries that could not be written",
    )
    .expect("metric creation failed")
});

// Node trust
pub static TRUSTED_STORAGE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_trusted_storage",
        "1 when the node runs on authoritative storage",
    )
    .expect("metric creation failed")
});

pub static MODE_DOWNGRADED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "trove_mode_downgraded",
        "1 when the declared node mode was narrowed at startup",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(POOL_MAX_CONNECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_CONNECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_ACQUIRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_ACQUIRE_COUNT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_WAIT_COUNT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_WAIT_SECONDS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_ROLE_INVOCATIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_TRANSACTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AUDIT_WRITE_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TRUSTED_STORAGE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MODE_DOWNGRADED.clone()))
            .expect("metric registration failed");
    });
}

fn gauge_value(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Copy a pool snapshot into the pool gauges.
pub fn record_pool_stats(stats: &PoolStats) {
    POOL_MAX_CONNECTIONS.set(i64::from(stats.max_connections));
    POOL_CONNECTIONS
        .with_label_values(&["total"])
        .set(i64::from(stats.total_connections));
    POOL_CONNECTIONS
        .with_label_values(&["idle"])
        .set(i64::from(stats.idle_connections));
    POOL_ACQUIRED.set(gauge_value(stats.acquired));
    POOL_ACQUIRE_COUNT.set(gauge_value(stats.acquire_count));
    POOL_WAIT_COUNT.set(gauge_value(stats.wait_count));
    POOL_WAIT_SECONDS.set(stats.wait_duration.as_secs_f64());
    for (role, count) in &stats.role_invocations {
        POOL_ROLE_INVOCATIONS
            .with_label_values(&[role.as_str()])
            .set(gauge_value(*count));
    }
    POOL_TRANSACTIONS
        .with_label_values(&["committed"])
        .set(gauge_value(stats.commits));
    POOL_TRANSACTIONS
        .with_label_values(&["rolled_back"])
        .set(gauge_value(stats.rollbacks));
    AUDIT_WRITE_FAILURES.set(gauge_value(stats.audit_failures));
}

/// Publish the startup mode decision.
pub fn record_mode(enforcement: &ModeEnforcementResult) {
    TRUSTED_STORAGE.set(i64::from(enforcement.is_trusted_storage));
    MODE_DOWNGRADED.set(i64::from(enforcement.downgraded));
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    record_pool_stats(&state.metadata.pool_stats());
    record_mode(&state.enforcement);

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
