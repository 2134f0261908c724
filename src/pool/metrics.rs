use super::connection::CloseReason;

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;
#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref DIALS_TOTAL: IntCounter = register_int_counter!(
        "connpool_dials_total",
        "Total number of successful TCP dials made by connection pools"
    )
    .expect("register connpool_dials_total counter");
    pub static ref DIAL_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "connpool_dial_failures_total",
        "Total number of failed dials surfaced to callers of acquire"
    )
    .expect("register connpool_dial_failures_total counter");
    pub static ref WARMUP_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "connpool_warmup_failures_total",
        "Total number of dials that failed while pre-warming a pool"
    )
    .expect("register connpool_warmup_failures_total counter");
    pub static ref REUSED_TOTAL: IntCounter = register_int_counter!(
        "connpool_reused_total",
        "Total number of idle connections handed out again"
    )
    .expect("register connpool_reused_total counter");
    pub static ref CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "connpool_closed_total",
        "Total number of pooled connections closed, by reason",
        &["reason"]
    )
    .expect("register connpool_closed_total counter_vec");
    pub static ref IDLE_CONNECTIONS: IntGauge = register_int_gauge!(
        "connpool_idle_connections",
        "Number of idle connections currently held across all pools"
    )
    .expect("register connpool_idle_connections gauge");
}

/// Process-wide pool counters. No-ops without the `metrics` feature.
#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics;

#[cfg(feature = "metrics")]
impl PoolMetrics {
    #[inline]
    pub fn record_dial() {
        DIALS_TOTAL.inc();
    }

    #[inline]
    pub fn record_dial_failure() {
        DIAL_FAILURES_TOTAL.inc();
    }

    #[inline]
    pub fn record_warmup_failure() {
        WARMUP_FAILURES_TOTAL.inc();
    }

    #[inline]
    pub fn record_reuse() {
        REUSED_TOTAL.inc();
    }

    #[inline]
    pub fn record_close(reason: CloseReason) {
        CLOSED_TOTAL.with_label_values(&[reason.as_str()]).inc();
    }

    #[inline]
    pub fn idle_added() {
        IDLE_CONNECTIONS.inc();
    }

    #[inline]
    pub fn idle_removed() {
        IDLE_CONNECTIONS.dec();
    }
}

#[cfg(not(feature = "metrics"))]
impl PoolMetrics {
    #[inline]
    pub fn record_dial() {}

    #[inline]
    pub fn record_dial_failure() {}

    #[inline]
    pub fn record_warmup_failure() {}

    #[inline]
    pub fn record_reuse() {}

    #[inline]
    pub fn record_close(_reason: CloseReason) {}

    #[inline]
    pub fn idle_added() {}

    #[inline]
    pub fn idle_removed() {}
}
