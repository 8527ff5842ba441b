//! Component C: per-connection idle-timeout enforcement, independent of any
//! application-level read/write deadline (spec.md §4.3).

mod conn;
mod worker;

pub use conn::{ConnClosed, TrackedConn};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use conn::ConnState;
use worker::WorkerPool;

/// Default cap on concurrent monitor workers per wrapped listener/dialer
/// (spec.md §4.3, "Worker scaling"; §9 treats it as a tunable).
pub const DEFAULT_WORKER_CAP: usize = 2;

/// Anything that can produce a fresh connection to wrap: a listener's
/// `Accept`, generalised over network type.
pub trait Accept: Send + Sync {
    type Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + AsRawFd + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

impl Accept for crate::listener::ListenerHandle {
    type Conn = crate::listener::Conn;

    async fn accept(&self) -> io::Result<Self::Conn> {
        crate::listener::ListenerHandle::accept(self).await
    }
}

impl Accept for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(s, _)| s)
    }
}

/// Anything that can dial out a fresh connection.
pub trait Dial: Send + Sync {
    type Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + AsRawFd + Unpin + Send + 'static;

    fn dial(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// The simplest possible [`Dial`]: plain TCP, no connection pooling (that is
/// an explicit non-goal per spec.md §1).
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dial for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Configuration for one reaper instance. Each call to [`Reaper::wrap_listener`]
/// or [`Reaper::wrap_dialer`] gets its own independent worker pool, matching
/// spec.md's "a bounded number of monitor workers... exists per listener or
/// dialer".
#[derive(Debug, Clone, Copy)]
pub struct Reaper {
    timeout: Duration,
    interval: Duration,
    worker_cap: usize,
}

impl Reaper {
    /// `timeout` is raised to `interval` if it is smaller (spec.md §4.3,
    /// "Interval floor"). `interval == Duration::ZERO` disables reaping
    /// entirely: wrapped listeners/dialers still produce [`TrackedConn`]s
    /// (for a uniform type), but no worker is ever started and
    /// `set_monitor_enabled` is simply inert.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self::with_worker_cap(timeout, interval, DEFAULT_WORKER_CAP)
    }

    pub fn with_worker_cap(timeout: Duration, interval: Duration, worker_cap: usize) -> Self {
        let timeout = timeout.max(interval);
        Self {
            timeout,
            interval,
            worker_cap,
        }
    }

    fn new_pool(&self) -> Option<Arc<WorkerPool>> {
        if self.interval.is_zero() {
            None
        } else {
            Some(WorkerPool::new(self.timeout, self.interval, self.worker_cap))
        }
    }

    /// `WrapListener(listener, timeout, interval) -> listener` (spec.md
    /// §4.3). Accepted connections start with monitoring disabled; call
    /// [`TrackedConn::set_monitor_enabled`] to opt in.
    pub fn wrap_listener<A: Accept>(&self, inner: A) -> ReaperListener<A> {
        ReaperListener {
            inner,
            pool: self.new_pool(),
        }
    }

    /// `WrapDialer(dialer, timeout, interval, enableByDefault) -> dialer`.
    pub fn wrap_dialer<D: Dial>(&self, inner: D, enable_by_default: bool) -> ReaperDialer<D> {
        ReaperDialer {
            inner,
            pool: self.new_pool(),
            enable_by_default,
        }
    }
}

pub struct ReaperListener<A: Accept> {
    inner: A,
    pool: Option<Arc<WorkerPool>>,
}

impl<A: Accept> ReaperListener<A> {
    pub async fn accept(&self) -> io::Result<TrackedConn<A::Conn>> {
        let conn = self.inner.accept().await?;
        Ok(self.track(conn, false).await)
    }

    async fn track(&self, conn: A::Conn, enable_by_default: bool) -> TrackedConn<A::Conn> {
        let state = Arc::new(ConnState::new(conn.as_raw_fd(), enable_by_default));
        if let Some(pool) = &self.pool {
            pool.dispatch(Arc::clone(&state)).await;
        }
        TrackedConn::new(conn, state)
    }
}

pub struct ReaperDialer<D: Dial> {
    inner: D,
    pool: Option<Arc<WorkerPool>>,
    enable_by_default: bool,
}

impl<D: Dial> ReaperDialer<D> {
    pub async fn dial(&self, addr: SocketAddr) -> io::Result<TrackedConn<D::Conn>> {
        let conn = self.inner.dial(addr).await?;
        let state = Arc::new(ConnState::new(conn.as_raw_fd(), self.enable_by_default));
        if let Some(pool) = &self.pool {
            pool.dispatch(Arc::clone(&state)).await;
        }
        Ok(TrackedConn::new(conn, state))
    }
}

/// Free-function form of `IOActivityTimeout(conn, enable)` (spec.md §4.3),
/// for callers that prefer not to reach for the method on [`TrackedConn`].
pub fn io_activity_timeout<S>(conn: &TrackedConn<S>, enable: bool) -> Result<(), ConnClosed> {
    conn.set_monitor_enabled(enable)
}

#[cfg(test)]
pub(crate) fn worker_count<A: Accept>(listener: &ReaperListener<A>) -> usize {
    listener.pool.as_ref().map(|p| p.worker_count()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn bind_loopback() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.expect("bind loopback")
    }

    /// Scenario S6: worker count never exceeds the configured cap, even
    /// dispatching many connections in quick succession.
    #[tokio::test]
    async fn worker_pool_respects_cap() {
        let listener = bind_loopback().await;
        let addr = listener.local_addr().unwrap();
        let reaper = Reaper::with_worker_cap(Duration::from_secs(60), Duration::from_millis(20), 2);
        let wrapped = reaper.wrap_listener(listener);

        let accept_task = tokio::spawn(async move {
            let mut conns = Vec::new();
            for _ in 0..50 {
                conns.push(wrapped.accept().await.unwrap());
                assert!(worker_count(&wrapped) <= 2);
            }
            conns
        });

        let mut clients = Vec::new();
        for _ in 0..50 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }

        let conns = accept_task.await.unwrap();
        assert_eq!(conns.len(), 50);
        drop(clients);
    }

    /// Property 4: the underlying close happens at most once regardless of
    /// interleaving between an explicit disable and a reaper-driven close.
    #[tokio::test]
    async fn reaper_close_is_idempotent() {
        let listener = bind_loopback().await;
        let addr = listener.local_addr().unwrap();
        let reaper = Reaper::with_worker_cap(Duration::from_millis(50), Duration::from_millis(10), 1);
        let wrapped = reaper.wrap_listener(listener);

        let server_task = tokio::spawn(async move {
            let mut conn = wrapped.accept().await.unwrap();
            conn.set_monitor_enabled(true).unwrap();
            // Wait past the idle timeout so the reaper races with our own
            // explicit disable-and-drop.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = conn.set_monitor_enabled(false);
            let buf = [0u8; 1];
            let _ = conn.write(&buf).await;
        });

        let _client = TcpStream::connect(addr).await.unwrap();
        server_task.await.unwrap();
    }
}
