//! The per-connection activity-accounting wrapper (spec.md §3, §4.3).

use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use nix::sys::socket::{shutdown, Shutdown};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared state for one wrapped connection. The activity counter's low bit
/// is the "closed" flag; the remaining bits are a tick count of successful
/// I/O. Both producers (the connection itself, on every successful read or
/// write) and the single owning monitor worker observe this lock-free.
pub(crate) struct ConnState {
    active_count: AtomicU64,
    monitor_enabled: AtomicU32,
    raw_fd: RawFd,
}

impl ConnState {
    pub(crate) fn new(raw_fd: RawFd, enable_by_default: bool) -> Self {
        Self {
            active_count: AtomicU64::new(0),
            monitor_enabled: AtomicU32::new(enable_by_default as u32),
            raw_fd,
        }
    }

    fn record_activity(&self) {
        // Increment by two: the low bit is reserved for the closed flag and
        // must never be touched by an activity increment.
        self.active_count.fetch_add(2, Ordering::AcqRel);
    }

    pub(crate) fn count(&self) -> u64 {
        self.active_count.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.count() & 1 == 1
    }

    pub(crate) fn monitor_enabled(&self) -> bool {
        self.monitor_enabled.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_monitor_enabled(&self, enable: bool) {
        self.monitor_enabled.store(enable as u32, Ordering::Release);
    }

    /// Attempts the closed-bit CAS transition. The first caller to win
    /// performs the underlying `shutdown(2)`; every later caller (reaper
    /// tick, explicit disable-then-drop, duplicate close) is a no-op.
    pub(crate) fn try_close(&self) -> bool {
        let mut current = self.active_count.load(Ordering::Acquire);
        loop {
            if current & 1 == 1 {
                return false;
            }
            match self.active_count.compare_exchange_weak(
                current,
                current | 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Best-effort: unblocks any in-flight read/write on this
                    // fd. Errors (already shut down, bad fd) are expected
                    // and ignored.
                    let _ = shutdown(self.raw_fd, Shutdown::Both);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Wraps an `AsyncRead + AsyncWrite` connection, recording a successful read
/// or write as activity and closing the underlying socket at most once.
pub struct TrackedConn<S> {
    inner: S,
    pub(crate) state: Arc<ConnState>,
}

impl<S> TrackedConn<S> {
    pub(crate) fn new(inner: S, state: Arc<ConnState>) -> Self {
        Self { inner, state }
    }

    /// Enables or disables idle-timeout monitoring for this connection.
    /// Rejects the call if the connection is already closed.
    pub fn set_monitor_enabled(&self, enable: bool) -> Result<(), ConnClosed> {
        if self.state.is_closed() {
            return Err(ConnClosed);
        }
        self.state.set_monitor_enabled(enable);
        Ok(())
    }

    /// First-class accessor for the pre-wrap connection, so a decorator
    /// stacked on top of this one (e.g. a TLS layer a caller adds) never
    /// needs to reach through it via layout assumptions (spec.md §9).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("connection is already closed")]
pub struct ConnClosed;

impl<S: AsyncRead + Unpin> AsyncRead for TrackedConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                self.state.record_activity();
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                self.state.record_activity();
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for TrackedConn<S> {
    fn drop(&mut self) {
        // Ensures the closed bit is set and the underlying socket is shut
        // down even if the caller never disabled monitoring or closed
        // explicitly; idempotent with any prior reaper-initiated close.
        self.state.try_close();
    }
}
