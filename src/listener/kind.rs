use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use super::ListenerSpec;

/// Where a listener's underlying descriptor came from. Exposed so callers
/// (and tests) can assert on inheritance behaviour (spec.md §8 property 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Fresh,
    Inherited,
}

pub(super) enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A concrete, opened listening endpoint (spec.md §3). Cheap to clone: all
/// clones share the same underlying OS listener via `Arc`, which is how the
/// registry satisfies "resolution is idempotent per spec within one
/// generation" without requiring a second real bind.
#[derive(Clone)]
pub struct ListenerHandle {
    spec: ListenerSpec,
    kind: Arc<ListenerKind>,
    origin: Origin,
}

/// Either side of a TCP or Unix-domain accept, unified so [`Server`]
/// implementations can treat every connection the same way regardless of
/// which network produced it.
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ListenerHandle {
    pub(super) fn new(spec: ListenerSpec, kind: ListenerKind, origin: Origin) -> Self {
        Self {
            spec,
            kind: Arc::new(kind),
            origin,
        }
    }

    pub(super) fn clone_ref(&self) -> Self {
        self.clone()
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Accepts the next connection. Returns `Err` wrapping the standard "use
    /// of closed listener" condition exactly as `tokio::net` reports it;
    /// [`crate::server`]'s generic accept loop is responsible for treating
    /// cancellation-induced close as clean shutdown rather than propagating
    /// the error (spec.md §4.4).
    pub async fn accept(&self) -> io::Result<Conn> {
        match &*self.kind {
            ListenerKind::Tcp(l) => l.accept().await.map(|(s, _)| Conn::Tcp(s)),
            ListenerKind::Unix(l) => l.accept().await.map(|(s, _)| Conn::Unix(s)),
        }
    }

    pub fn local_description(&self) -> String {
        format!("{:?}://{}", self.spec.network, self.spec.address)
    }
}

impl AsRawFd for ListenerHandle {
    fn as_raw_fd(&self) -> RawFd {
        match &*self.kind {
            ListenerKind::Tcp(l) => l.as_raw_fd(),
            ListenerKind::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl AsRawFd for Conn {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Conn::Tcp(s) => s.as_raw_fd(),
            Conn::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
