use super::address::AddressPool;
use super::connection::{CloseReason, ConnectionMeta, PooledConnection, SessionTag};
use super::stats::PoolStats;
use crate::config::PoolConfig;
use crate::utils::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type PoolMap<M> = Arc<RwLock<HashMap<String, Arc<AddressPool<M>>>>>;

struct Sweeper {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Routes connection requests to per-address pools.
///
/// Pools are created on first use of an address and stay registered for the
/// lifetime of the manager; only their idle connections come and go. The
/// background sweep is explicit: call [`start`](Self::start) once a tokio
/// runtime is available and [`stop`](Self::stop) on teardown.
pub struct ConnectionManager<M = SessionTag> {
    config: PoolConfig,
    meta: M,
    pools: PoolMap<M>,
    sweeper: Mutex<Option<Sweeper>>,
    forced_closes: AtomicU64,
    unroutable_closes: AtomicU64,
}

impl ConnectionManager<SessionTag> {
    /// Manager whose connections carry the configured protocol version and
    /// expiry deadline.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let meta = SessionTag::new(config.protocol_version.clone(), config.expires_at());
        Self::with_meta(config, meta)
    }
}

impl<M: ConnectionMeta> ConnectionManager<M> {
    /// Manager that clones `meta` into every connection it dials.
    ///
    /// Fails with a configuration error when `config` does not validate.
    pub fn with_meta(config: PoolConfig, meta: M) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            meta,
            pools: Arc::new(RwLock::new(HashMap::new())),
            sweeper: Mutex::new(None),
            forced_closes: AtomicU64::new(0),
            unroutable_closes: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a connection to `address`, reusing an idle one when possible.
    ///
    /// The first call for an address registers its pool and pre-warms it;
    /// concurrent first callers share that pool and its single warm-up.
    pub async fn acquire(&self, address: &str) -> Result<PooledConnection<M>> {
        let key = canonical_address(address);
        let pool = self.pool_for(&key).await;
        pool.warm_up().await;
        pool.acquire().await
    }

    async fn pool_for(&self, key: &str) -> Arc<AddressPool<M>> {
        if let Some(pool) = self.pools.read().await.get(key) {
            return Arc::clone(pool);
        }

        let mut pools = self.pools.write().await;
        let pool = pools.entry(key.to_string()).or_insert_with(|| {
            debug!(address = key, "Registering address pool");
            Arc::new(AddressPool::new(key, &self.config, self.meta.clone()))
        });
        Arc::clone(pool)
    }

    /// Return a connection.
    ///
    /// With `force_close` the connection is closed. Otherwise it goes back
    /// to the pool matching its peer address; a connection whose peer cannot
    /// be determined or has no pool is closed.
    pub async fn release(&self, conn: PooledConnection<M>, force_close: bool) {
        if force_close {
            self.forced_closes.fetch_add(1, Ordering::Relaxed);
            conn.close(CloseReason::Forced);
            return;
        }

        let key = match conn.peer_addr() {
            Ok(peer) => peer.to_string(),
            Err(e) => {
                debug!(id = conn.id(), error = %e, "Released connection has no peer, closing");
                self.unroutable_closes.fetch_add(1, Ordering::Relaxed);
                conn.close(CloseReason::Unroutable);
                return;
            }
        };

        let pool = self.pools.read().await.get(&key).cloned();
        match pool {
            Some(pool) => pool.put(conn),
            None => {
                trace!(address = %key, "No pool for released connection, closing");
                self.unroutable_closes.fetch_add(1, Ordering::Relaxed);
                conn.close(CloseReason::Unroutable);
            }
        }
    }

    /// Spawn the periodic sweep. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.sweeper_slot();
        if sweeper.is_some() {
            return;
        }

        let cancel_token = CancellationToken::new();
        let period = self.config.sweep_interval();
        let handle = spawn_sweeper(Arc::clone(&self.pools), period, cancel_token.clone());
        *sweeper = Some(Sweeper {
            cancel_token,
            handle,
        });

        info!(
            interval_ms = period.as_millis() as u64,
            idle_timeout_ms = self.config.idle_timeout_ms,
            "Connection pool sweeper started"
        );
    }

    /// Cancel the sweep task and wait for it to finish.
    pub async fn stop(&self) {
        let sweeper = self.sweeper_slot().take();
        let Some(sweeper) = sweeper else {
            return;
        };

        sweeper.cancel_token.cancel();
        if let Err(e) = sweeper.handle.await {
            warn!(error = %e, "Connection pool sweeper ended abnormally");
        }
        info!("Connection pool sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.sweeper_slot().is_some()
    }

    /// Run one sweep over every pool now. Returns the number of closed connections.
    pub async fn sweep_now(&self) -> usize {
        sweep_pools(&self.pools).await
    }

    /// Close all idle connections. Pools stay registered.
    pub async fn drain(&self) -> usize {
        let drained: usize = self.snapshot().await.iter().map(|pool| pool.drain()).sum();
        if drained > 0 {
            debug!(drained, "Drained idle connections");
        }
        drained
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Idle connections held for `address`, `None` if no pool exists yet.
    pub async fn idle_count(&self, address: &str) -> Option<usize> {
        let key = canonical_address(address);
        self.pools.read().await.get(&key).map(|pool| pool.idle_len())
    }

    pub async fn stats(&self) -> PoolStats {
        let mut addresses: Vec<_> = self
            .snapshot()
            .await
            .iter()
            .map(|pool| pool.stats())
            .collect();
        addresses.sort_by(|a, b| a.address.cmp(&b.address));

        PoolStats {
            total_idle: addresses.iter().map(|pool| pool.idle).sum(),
            pools: addresses.len(),
            forced_closes: self.forced_closes.load(Ordering::Relaxed),
            unroutable_closes: self.unroutable_closes.load(Ordering::Relaxed),
            addresses,
        }
    }

    async fn snapshot(&self) -> Vec<Arc<AddressPool<M>>> {
        self.pools.read().await.values().cloned().collect()
    }

    fn sweeper_slot(&self) -> MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M> Drop for ConnectionManager<M> {
    fn drop(&mut self) {
        let slot = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(sweeper) = slot.take() {
            sweeper.cancel_token.cancel();
        }
    }
}

/// Key under which a pool is registered.
///
/// Socket addresses are normalised to the form `peer_addr()` reports, so a
/// released connection finds its pool. Host names are kept verbatim.
pub fn canonical_address(address: &str) -> String {
    address
        .parse::<SocketAddr>()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| address.to_string())
}

fn spawn_sweeper<M: ConnectionMeta>(
    pools: PoolMap<M>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = sweep_pools(&pools).await;
                    if closed > 0 {
                        debug!(closed, "Periodic sweep closed idle connections");
                    }
                }
            }
        }
    })
}

async fn sweep_pools<M: ConnectionMeta>(pools: &PoolMap<M>) -> usize {
    // Sweep outside the map lock
    let snapshot: Vec<_> = pools.read().await.values().cloned().collect();
    snapshot.iter().map(|pool| pool.sweep()).sum()
}
