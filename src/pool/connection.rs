use super::metrics::PoolMetrics;
use crate::utils::error::{ConnPoolError, Result};
use socket2::SockRef;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata attached to every connection a pool dials.
///
/// The pool clones its template into each new connection and carries it
/// unchanged across reuse. `is_expired` is consulted before a connection is
/// handed out again.
pub trait ConnectionMeta: Clone + Debug + Send + Sync + 'static {
    fn is_expired(&self, _now: SystemTime) -> bool {
        false
    }
}

impl ConnectionMeta for () {}

/// Protocol tag and credential deadline for authenticated sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTag {
    pub protocol_version: Option<String>,
    /// Absolute deadline, connections are not reused once it has passed
    pub expires_at: Option<SystemTime>,
}

impl SessionTag {
    pub fn new(protocol_version: Option<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            protocol_version,
            expires_at,
        }
    }
}

impl ConnectionMeta for SessionTag {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

/// Why a connection was closed instead of being pooled or handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    IdleTimeout,
    Expired,
    Overflow,
    Forced,
    Unroutable,
    Drained,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Expired => "expired",
            CloseReason::Overflow => "overflow",
            CloseReason::Forced => "forced",
            CloseReason::Unroutable => "unroutable",
            CloseReason::Drained => "drained",
        }
    }
}

/// A TCP connection owned either by one caller or by one pool's idle set.
#[derive(Debug)]
pub struct PooledConnection<M = SessionTag> {
    id: u64,
    stream: TcpStream,
    meta: M,
    created_at: Instant,
    reuse_count: u64,
}

impl<M: ConnectionMeta> PooledConnection<M> {
    pub(crate) fn new(stream: TcpStream, meta: M) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            meta,
            created_at: Instant::now(),
            reuse_count: 0,
        }
    }

    /// Process-unique identifier, stable across reuse
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Detach the socket from pool bookkeeping. It can no longer be released.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of times this connection was handed out from an idle set
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    pub fn is_expired(&self) -> bool {
        self.meta.is_expired(SystemTime::now())
    }

    pub(crate) fn close(self, reason: CloseReason) {
        trace!(
            id = self.id,
            reason = reason.as_str(),
            age_ms = self.created_at.elapsed().as_millis() as u64,
            "Closing pooled connection"
        );
        PoolMetrics::record_close(reason);
        drop(self.stream);
    }

    pub(crate) fn into_idle(self) -> IdleConnection<M> {
        IdleConnection {
            conn: self,
            idle_since: Instant::now(),
        }
    }
}

impl<M: ConnectionMeta + Unpin> AsyncRead for PooledConnection<M> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<M: ConnectionMeta + Unpin> AsyncWrite for PooledConnection<M> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A connection parked in an idle set, stamped with the time it was parked.
#[derive(Debug)]
pub(crate) struct IdleConnection<M> {
    conn: PooledConnection<M>,
    idle_since: Instant,
}

impl<M: ConnectionMeta> IdleConnection<M> {
    pub(crate) fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    pub(crate) fn is_expired(&self, now: SystemTime) -> bool {
        self.conn.meta.is_expired(now)
    }

    pub(crate) fn checkout(mut self) -> PooledConnection<M> {
        self.conn.reuse_count += 1;
        self.conn
    }

    pub(crate) fn close(self, reason: CloseReason) {
        self.conn.close(reason);
    }
}

/// Open a TCP connection to `address` with keep-alive and no-delay enabled.
///
/// Without a timeout the dial waits as long as the OS does.
pub async fn dial(address: &str, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let connect = TcpStream::connect(address);

    let result = match connect_timeout {
        Some(limit) => match timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Connection to {} timed out after {:?}", address, limit),
            )),
        },
        None => connect.await,
    };

    let stream = result.map_err(|e| ConnPoolError::dial(address, e))?;
    configure_stream(&stream).map_err(|e| ConnPoolError::dial(address, e))?;

    Ok(stream)
}

/// Socket options every pooled connection carries.
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}
