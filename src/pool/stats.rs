use super::connection::CloseReason;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters of a single address pool.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    dialed: AtomicU64,
    dial_failures: AtomicU64,
    warmup_failures: AtomicU64,
    reused: AtomicU64,
    closed_idle_timeout: AtomicU64,
    closed_expired: AtomicU64,
    closed_overflow: AtomicU64,
    closed_drained: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn dialed(&self) {
        self.dialed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn warmup_failed(&self) {
        self.warmup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn closed(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::IdleTimeout => &self.closed_idle_timeout,
            CloseReason::Expired => &self.closed_expired,
            CloseReason::Overflow => &self.closed_overflow,
            CloseReason::Drained => &self.closed_drained,
            // Closed by the manager before reaching a pool
            CloseReason::Forced | CloseReason::Unroutable => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            dialed: self.dialed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            warmup_failures: self.warmup_failures.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            closed_idle_timeout: self.closed_idle_timeout.load(Ordering::Relaxed),
            closed_expired: self.closed_expired.load(Ordering::Relaxed),
            closed_overflow: self.closed_overflow.load(Ordering::Relaxed),
            closed_drained: self.closed_drained.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Successful dials, warm-up included
    pub dialed: u64,
    pub dial_failures: u64,
    pub warmup_failures: u64,
    pub reused: u64,
    pub closed_idle_timeout: u64,
    pub closed_expired: u64,
    pub closed_overflow: u64,
    pub closed_drained: u64,
}

/// Point-in-time view of one address pool.
#[derive(Debug, Clone, Serialize)]
pub struct AddressPoolStats {
    pub address: String,
    pub idle: usize,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub warmed_up: bool,
    pub counters: CounterSnapshot,
}

/// Point-in-time view of a connection manager.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Total number of idle connections
    pub total_idle: usize,
    /// Number of registered address pools
    pub pools: usize,
    /// Connections closed on release at the caller's request
    pub forced_closes: u64,
    /// Connections released with no matching pool
    pub unroutable_closes: u64,
    pub addresses: Vec<AddressPoolStats>,
}
