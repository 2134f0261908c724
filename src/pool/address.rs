use super::connection::{
    dial, CloseReason, ConnectionMeta, IdleConnection, PooledConnection, SessionTag,
};
use super::metrics::PoolMetrics;
use super::stats::{AddressPoolStats, PoolCounters};
use crate::config::PoolConfig;
use crate::utils::error::Result;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

/// Upper bound on idle slots reserved up front; the set grows on demand past it.
const INITIAL_IDLE_SLOTS: usize = 64;

/// Bounded set of idle connections to a single remote address.
///
/// Every operation on the idle set is non-blocking: deposits beyond
/// `max_capacity` close the connection on the spot, and `acquire` falls
/// through to a fresh dial once the set runs dry. The idle-set lock is
/// never held across an `.await`.
#[derive(Debug)]
pub struct AddressPool<M = SessionTag> {
    address: String,
    idle: Mutex<VecDeque<IdleConnection<M>>>,
    min_capacity: usize,
    max_capacity: usize,
    idle_timeout: Duration,
    connect_timeout: Option<Duration>,
    purge_expired_on_sweep: bool,
    meta: M,
    warmed: OnceCell<usize>,
    counters: PoolCounters,
}

impl<M: ConnectionMeta> AddressPool<M> {
    /// Create an empty pool. Nothing is dialed until [`warm_up`](Self::warm_up)
    /// or [`acquire`](Self::acquire).
    pub fn new(address: impl Into<String>, config: &PoolConfig, meta: M) -> Self {
        Self {
            address: address.into(),
            idle: Mutex::new(VecDeque::with_capacity(config.max_capacity.min(INITIAL_IDLE_SLOTS))),
            min_capacity: config.min_capacity,
            max_capacity: config.max_capacity,
            idle_timeout: config.idle_timeout(),
            connect_timeout: config.connect_timeout(),
            purge_expired_on_sweep: config.purge_expired_on_sweep,
            meta,
            warmed: OnceCell::new(),
            counters: PoolCounters::default(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn idle_len(&self) -> usize {
        self.idle_set().len()
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmed.initialized()
    }

    /// Dial `min_capacity` connections into the idle set, once per pool.
    ///
    /// Concurrent callers share the single warm-up burst. Failed dials are
    /// counted and logged, never returned. Returns how many dials succeeded.
    pub async fn warm_up(&self) -> usize {
        *self.warmed.get_or_init(|| self.dial_initial()).await
    }

    async fn dial_initial(&self) -> usize {
        let mut established = 0;

        for _ in 0..self.min_capacity {
            match dial(&self.address, self.connect_timeout).await {
                Ok(stream) => {
                    self.counters.dialed();
                    PoolMetrics::record_dial();
                    self.put(PooledConnection::new(stream, self.meta.clone()));
                    established += 1;
                }
                Err(e) => {
                    self.counters.warmup_failed();
                    PoolMetrics::record_warmup_failure();
                    debug!(address = %self.address, error = %e, "Warm-up dial failed");
                }
            }
        }

        if self.min_capacity > 0 && established == 0 {
            warn!(
                address = %self.address,
                attempts = self.min_capacity,
                "All warm-up dials failed, pool starts empty"
            );
        } else if established < self.min_capacity {
            debug!(
                address = %self.address,
                established,
                wanted = self.min_capacity,
                "Pool warmed up partially"
            );
        }

        established
    }

    /// Deposit a connection into the idle set, stamping it idle as of now.
    ///
    /// A full idle set closes the connection immediately.
    pub fn put(&self, conn: PooledConnection<M>) {
        self.deposit(conn.into_idle());
    }

    fn deposit(&self, entry: IdleConnection<M>) {
        if let Err(entry) = self.try_push(entry) {
            trace!(address = %self.address, "Idle set is full, discarding connection");
            self.discard(entry, CloseReason::Overflow);
        }
    }

    /// Hand out an idle connection, or dial a new one when none is usable.
    ///
    /// Looks at no more candidates than were idle on entry, so concurrent
    /// deposits cannot keep the loop alive. Candidates idle for longer than
    /// the idle timeout or past their expiry are closed and skipped.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let candidates = self.idle_len();

        for _ in 0..candidates {
            let Some(entry) = self.try_pop() else {
                break;
            };

            let idle_for = entry.idle_for();
            if idle_for > self.idle_timeout {
                trace!(
                    address = %self.address,
                    idle_ms = idle_for.as_millis() as u64,
                    "Discarding stale idle connection"
                );
                self.discard(entry, CloseReason::IdleTimeout);
                continue;
            }

            if entry.is_expired(SystemTime::now()) {
                trace!(address = %self.address, "Discarding expired idle connection");
                self.discard(entry, CloseReason::Expired);
                continue;
            }

            self.counters.reused();
            PoolMetrics::record_reuse();
            let conn = entry.checkout();
            trace!(address = %self.address, id = conn.id(), "Reusing pooled connection");
            return Ok(conn);
        }

        debug!(address = %self.address, "Pool miss, dialing new connection");
        self.connect().await
    }

    async fn connect(&self) -> Result<PooledConnection<M>> {
        match dial(&self.address, self.connect_timeout).await {
            Ok(stream) => {
                self.counters.dialed();
                PoolMetrics::record_dial();
                Ok(PooledConnection::new(stream, self.meta.clone()))
            }
            Err(e) => {
                self.counters.dial_failed();
                PoolMetrics::record_dial_failure();
                debug!(address = %self.address, error = %e, "Dial failed");
                Err(e)
            }
        }
    }

    /// One pass over the idle set closing connections idle past the timeout.
    ///
    /// Survivors go back with their original idle stamp. Expiry is only
    /// checked here when `purge_expired_on_sweep` is set. Returns the number
    /// of connections closed.
    pub fn sweep(&self) -> usize {
        let pending = self.idle_len();
        let now = SystemTime::now();
        let mut closed = 0;

        for _ in 0..pending {
            let Some(entry) = self.try_pop() else {
                break;
            };

            if entry.idle_for() > self.idle_timeout {
                self.discard(entry, CloseReason::IdleTimeout);
                closed += 1;
            } else if self.purge_expired_on_sweep && entry.is_expired(now) {
                self.discard(entry, CloseReason::Expired);
                closed += 1;
            } else {
                self.deposit(entry);
            }
        }

        if closed > 0 {
            trace!(address = %self.address, closed, "Sweep closed idle connections");
        }

        closed
    }

    /// Close every idle connection. The pool stays usable.
    pub fn drain(&self) -> usize {
        let drained = std::mem::take(&mut *self.idle_set());
        let count = drained.len();

        for entry in drained {
            PoolMetrics::idle_removed();
            self.discard(entry, CloseReason::Drained);
        }

        count
    }

    pub fn stats(&self) -> AddressPoolStats {
        AddressPoolStats {
            address: self.address.clone(),
            idle: self.idle_len(),
            min_capacity: self.min_capacity,
            max_capacity: self.max_capacity,
            warmed_up: self.is_warmed_up(),
            counters: self.counters.snapshot(),
        }
    }

    fn try_push(&self, entry: IdleConnection<M>) -> std::result::Result<(), IdleConnection<M>> {
        let mut idle = self.idle_set();
        if idle.len() >= self.max_capacity {
            return Err(entry);
        }
        idle.push_back(entry);
        PoolMetrics::idle_added();
        Ok(())
    }

    fn try_pop(&self) -> Option<IdleConnection<M>> {
        let entry = self.idle_set().pop_front();
        if entry.is_some() {
            PoolMetrics::idle_removed();
        }
        entry
    }

    fn discard(&self, entry: IdleConnection<M>, reason: CloseReason) {
        self.counters.closed(reason);
        entry.close(reason);
    }

    fn idle_set(&self) -> MutexGuard<'_, VecDeque<IdleConnection<M>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M> Drop for AddressPool<M> {
    fn drop(&mut self) {
        let idle = std::mem::take(self.idle.get_mut().unwrap_or_else(PoisonError::into_inner));
        if idle.is_empty() {
            return;
        }

        trace!(address = %self.address, count = idle.len(), "Closing idle connections of dropped pool");
        for entry in idle {
            PoolMetrics::idle_removed();
            PoolMetrics::record_close(CloseReason::Drained);
            drop(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn spawn_listener() -> (String, mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });

        (addr, rx)
    }

    fn config(min: usize, max: usize, idle_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            min_capacity: min,
            max_capacity: max,
            idle_timeout_ms,
            ..Default::default()
        }
    }

    async fn assert_closed(server: &mut TcpStream) {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf))
            .await
            .expect("peer did not close in time");
        assert!(matches!(read, Ok(0)) || read.is_err());
    }

    #[tokio::test]
    async fn new_pool_is_empty_until_warmed() {
        let (addr, _accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(2, 4, 30_000), ());

        assert_eq!(pool.idle_len(), 0);
        assert!(!pool.is_warmed_up());

        assert_eq!(pool.warm_up().await, 2);
        assert_eq!(pool.idle_len(), 2);
        assert!(pool.is_warmed_up());

        // Second call does not dial again
        assert_eq!(pool.warm_up().await, 2);
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(pool.stats().counters.dialed, 2);
    }

    #[tokio::test]
    async fn warm_up_failures_are_swallowed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = AddressPool::new(addr, &config(3, 4, 30_000), ());
        assert_eq!(pool.warm_up().await, 0);
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.stats().counters.warmup_failures, 3);
    }

    #[tokio::test]
    async fn acquire_prefers_idle_connections() {
        let (addr, _accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(0, 4, 30_000), ());

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.put(conn);
        assert_eq!(pool.idle_len(), 1);

        let reused = pool.acquire().await.unwrap();
        assert_eq!(reused.id(), id);
        assert_eq!(reused.reuse_count(), 1);
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.stats().counters.reused, 1);
    }

    #[tokio::test]
    async fn put_beyond_capacity_closes_connection() {
        let (addr, mut accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(0, 1, 30_000), ());

        let first = pool.acquire().await.unwrap();
        let _server_first = accepted.recv().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let mut server_second = accepted.recv().await.unwrap();

        pool.put(first);
        pool.put(second);

        assert_eq!(pool.idle_len(), 1);
        assert_eq!(pool.stats().counters.closed_overflow, 1);
        assert_closed(&mut server_second).await;
    }

    #[tokio::test]
    async fn acquire_skips_stale_connections() {
        let (addr, mut accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(0, 4, 50), ());

        let conn = pool.acquire().await.unwrap();
        let mut server = accepted.recv().await.unwrap();
        let stale_id = conn.id();
        pool.put(conn);

        tokio::time::sleep(Duration::from_millis(120)).await;

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), stale_id);
        assert_eq!(pool.stats().counters.closed_idle_timeout, 1);
        assert_closed(&mut server).await;
    }

    #[tokio::test]
    async fn sweep_on_empty_pool_is_noop() {
        let (addr, _accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(0, 4, 50), ());

        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_connections() {
        let (addr, _accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(2, 4, 30_000), ());
        pool.warm_up().await;

        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.idle_len(), 2);
    }

    #[tokio::test]
    async fn sweep_ignores_expiry_unless_enabled() {
        let (addr, _accepted) = spawn_listener().await;
        let expired = SessionTag::new(None, Some(SystemTime::now() - Duration::from_secs(5)));

        let lenient = AddressPool::new(addr.clone(), &config(1, 4, 30_000), expired.clone());
        lenient.warm_up().await;
        assert_eq!(lenient.sweep(), 0);
        assert_eq!(lenient.idle_len(), 1);

        let strict_config = PoolConfig {
            purge_expired_on_sweep: true,
            ..config(1, 4, 30_000)
        };
        let strict = AddressPool::new(addr, &strict_config, expired);
        strict.warm_up().await;
        assert_eq!(strict.sweep(), 1);
        assert_eq!(strict.idle_len(), 0);
        assert_eq!(strict.stats().counters.closed_expired, 1);
    }

    #[tokio::test]
    async fn drain_closes_everything() {
        let (addr, _accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(3, 4, 30_000), ());
        pool.warm_up().await;

        assert_eq!(pool.drain(), 3);
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.stats().counters.closed_drained, 3);
    }

    #[tokio::test]
    async fn huge_max_capacity_does_not_preallocate() {
        let (addr, _accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(1, usize::MAX, 30_000), ());

        pool.warm_up().await;
        assert_eq!(pool.idle_len(), 1);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn dropping_a_pool_closes_its_idle_connections() {
        use crate::pool::metrics::CLOSED_TOTAL;

        let (addr, mut accepted) = spawn_listener().await;
        let pool = AddressPool::new(addr, &config(3, 4, 30_000), ());
        assert_eq!(pool.warm_up().await, 3);

        let mut servers = Vec::new();
        for _ in 0..3 {
            servers.push(accepted.recv().await.unwrap());
        }

        let drained_before = CLOSED_TOTAL.with_label_values(&["drained"]).get();
        drop(pool);
        let drained_after = CLOSED_TOTAL.with_label_values(&["drained"]).get();
        assert!(drained_after >= drained_before + 3);

        for server in &mut servers {
            assert_closed(server).await;
        }
    }

    #[tokio::test]
    async fn dialed_connections_carry_pool_meta() {
        let (addr, _accepted) = spawn_listener().await;
        let tag = SessionTag::new(Some("v3".to_string()), None);
        let pool = AddressPool::new(addr, &config(0, 4, 30_000), tag.clone());

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.meta(), &tag);
    }
}
