//! Component B: translates declarative [`ListenerSpec`]s into concrete
//! listening sockets, preferring descriptors inherited from the service
//! manager over opening fresh ones, and tracking everything the registry
//! currently owns so it can be exported wholesale on respawn (spec.md §4.2).

mod kind;

pub use kind::{Conn, ListenerHandle, Origin};
use kind::ListenerKind;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::Mutex;

use nix::sys::socket::{getsockname, SockaddrIn, SockaddrIn6, SockaddrStorage};
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};

use crate::notify::InheritedFd;

/// Declarative, immutable description of a listener to acquire. Used as the
/// resolution key for the registry (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerSpec {
    pub name: String,
    pub network: Network,
    pub address: String,
}

impl ListenerSpec {
    pub fn new(name: impl Into<String>, network: Network, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network,
            address: address.into(),
        }
    }
}

/// The networks this registry knows how to open and match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp6,
    Unix,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to bind {network:?} listener on {address}: {source}")]
    Bind {
        network: Network,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid address '{0}' for network {1:?}")]
    InvalidAddress(String, Network),
    #[error("inherited descriptor named '{0}' is not usable as a {1:?} listener")]
    BadInheritedFd(String, Network),
}

#[derive(Debug, Error)]
#[error("listener '{0}' was already exported")]
pub struct ExportError(pub String);

struct Unclaimed {
    fd: OwnedFd,
    name: String,
}

/// Resolves [`ListenerSpec`]s into [`ListenerHandle`]s, drawing first from
/// descriptors inherited from the service manager and falling back to
/// freshly-opened ones. One registry exists per supervisor; generations share
/// it so that reload can reuse already-bound sockets (spec.md §5, ordering
/// guarantees).
pub struct Registry {
    unclaimed: Mutex<Vec<Unclaimed>>,
    /// Handles resolved so far this generation, keyed by spec name, so a
    /// second `resolve` call for the same spec is idempotent (spec.md §4.2
    /// constraints).
    resolved: Mutex<HashMap<String, ListenerHandle>>,
    exported: Mutex<std::collections::HashSet<String>>,
}

impl Registry {
    /// Builds a registry seeded with whatever the service manager handed
    /// down at process start.
    pub fn new(inherited: Vec<InheritedFd>) -> Self {
        Self {
            unclaimed: Mutex::new(
                inherited
                    .into_iter()
                    .map(|f| Unclaimed {
                        fd: f.fd,
                        name: f.name,
                    })
                    .collect(),
            ),
            resolved: Mutex::new(HashMap::new()),
            exported: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Resolves a spec to a concrete listener. Idempotent within one
    /// generation: a second call with the same spec returns a handle sharing
    /// the same underlying listener (callers are expected to hand each
    /// `ListenerHandle` to exactly one server; re-resolving is only useful
    /// across reload, where the old generation's handle is still live).
    pub fn resolve(&self, spec: &ListenerSpec) -> Result<ListenerHandle, ResolveError> {
        if let Some(existing) = self.resolved.lock().unwrap().get(&spec.name) {
            return Ok(existing.clone_ref());
        }

        let handle = self.resolve_fresh(spec)?;
        self.resolved
            .lock()
            .unwrap()
            .insert(spec.name.clone(), handle.clone_ref());
        Ok(handle)
    }

    fn resolve_fresh(&self, spec: &ListenerSpec) -> Result<ListenerHandle, ResolveError> {
        // Step 1: match by name.
        if let Some(fd) = self.claim_by_name(&spec.name) {
            return self.wrap_inherited(spec, fd, &spec.name);
        }

        // Step 2: match by address (compatible network types only).
        if let Some((fd, name)) = self.claim_by_address(spec) {
            return self.wrap_inherited(spec, fd, &name);
        }

        // Step 3: open fresh.
        self.open_fresh(spec)
    }

    fn claim_by_name(&self, name: &str) -> Option<OwnedFd> {
        let mut unclaimed = self.unclaimed.lock().unwrap();
        let idx = unclaimed.iter().position(|u| u.name == name)?;
        Some(unclaimed.remove(idx).fd)
    }

    fn claim_by_address(&self, spec: &ListenerSpec) -> Option<(OwnedFd, String)> {
        if spec.network == Network::Unix {
            // Unix sockets are matched by name only (SPEC_FULL.md §4.2).
            return None;
        }
        let target: SocketAddr = spec.address.parse().ok()?;
        let mut unclaimed = self.unclaimed.lock().unwrap();
        let idx = unclaimed.iter().position(|u| {
            getsockname::<SockaddrStorage>(u.fd.as_raw_fd())
                .ok()
                .and_then(|sa| sockaddr_storage_to_std(&sa))
                .map(|addr| addr == target)
                .unwrap_or(false)
        })?;
        let u = unclaimed.remove(idx);
        Some((u.fd, u.name))
    }

    fn wrap_inherited(
        &self,
        spec: &ListenerSpec,
        fd: OwnedFd,
        claimed_name: &str,
    ) -> Result<ListenerHandle, ResolveError> {
        let kind = match spec.network {
            Network::Tcp | Network::Tcp6 => {
                let std_listener = std::net::TcpListener::from(fd);
                std_listener
                    .set_nonblocking(true)
                    .map_err(|_| ResolveError::BadInheritedFd(claimed_name.into(), spec.network))?;
                let listener = TcpListener::from_std(std_listener)
                    .map_err(|_| ResolveError::BadInheritedFd(claimed_name.into(), spec.network))?;
                ListenerKind::Tcp(listener)
            }
            Network::Unix => {
                let std_listener = StdUnixListener::from(fd);
                std_listener
                    .set_nonblocking(true)
                    .map_err(|_| ResolveError::BadInheritedFd(claimed_name.into(), spec.network))?;
                let listener = UnixListener::from_std(std_listener)
                    .map_err(|_| ResolveError::BadInheritedFd(claimed_name.into(), spec.network))?;
                ListenerKind::Unix(listener)
            }
        };
        Ok(ListenerHandle::new(spec.clone(), kind, Origin::Inherited))
    }

    fn open_fresh(&self, spec: &ListenerSpec) -> Result<ListenerHandle, ResolveError> {
        let kind = match spec.network {
            Network::Tcp | Network::Tcp6 => {
                let addr: SocketAddr = spec
                    .address
                    .parse()
                    .map_err(|_| ResolveError::InvalidAddress(spec.address.clone(), spec.network))?;
                let std_listener =
                    std::net::TcpListener::bind(addr).map_err(|source| ResolveError::Bind {
                        network: spec.network,
                        address: spec.address.clone(),
                        source,
                    })?;
                std_listener
                    .set_nonblocking(true)
                    .map_err(|source| ResolveError::Bind {
                        network: spec.network,
                        address: spec.address.clone(),
                        source,
                    })?;
                let listener =
                    TcpListener::from_std(std_listener).map_err(|source| ResolveError::Bind {
                        network: spec.network,
                        address: spec.address.clone(),
                        source,
                    })?;
                ListenerKind::Tcp(listener)
            }
            Network::Unix => {
                // Stale socket files from a previous unclean exit must not
                // block a fresh bind.
                let _ = std::fs::remove_file(&spec.address);
                let std_listener = StdUnixListener::bind(&spec.address).map_err(|source| {
                    ResolveError::Bind {
                        network: spec.network,
                        address: spec.address.clone(),
                        source,
                    }
                })?;
                std_listener
                    .set_nonblocking(true)
                    .map_err(|source| ResolveError::Bind {
                        network: spec.network,
                        address: spec.address.clone(),
                        source,
                    })?;
                let listener =
                    UnixListener::from_std(std_listener).map_err(|source| ResolveError::Bind {
                        network: spec.network,
                        address: spec.address.clone(),
                        source,
                    })?;
                ListenerKind::Unix(listener)
            }
        };
        Ok(ListenerHandle::new(spec.clone(), kind, Origin::Fresh))
    }

    /// Returns every currently-open listening descriptor together with its
    /// name, for handoff to a replacement process. Does not close them.
    ///
    /// Marks every returned name as exported so a second concurrent export
    /// of the same generation is rejected; callers whose respawn attempt
    /// does not end up completing must call [`Registry::unexport`] with the
    /// names this returned, so a later retry is not permanently poisoned.
    pub fn export(&self) -> Result<Vec<(RawFd, String)>, ExportError> {
        let resolved = self.resolved.lock().unwrap();
        let mut exported = self.exported.lock().unwrap();
        for name in resolved.keys() {
            if exported.contains(name) {
                return Err(ExportError(name.clone()));
            }
        }
        let mut out = Vec::with_capacity(resolved.len());
        for (name, handle) in resolved.iter() {
            exported.insert(name.clone());
            out.push((handle.as_raw_fd(), name.clone()));
        }
        Ok(out)
    }

    /// Rolls back a prior successful [`Registry::export`] for the given
    /// names, so a subsequent respawn attempt can export them again. Used
    /// when a respawn that already exported its listeners fails before the
    /// replacement process takes ownership of them (spec.md §7: "child not
    /// ready in time" and a failed fork/exec both fall back to `Running`,
    /// which must leave a later `Respawn()` able to succeed).
    pub fn unexport(&self, names: &[String]) {
        let mut exported = self.exported.lock().unwrap();
        for name in names {
            exported.remove(name);
        }
    }

    /// Closes every unclaimed inherited descriptor and every registry-held
    /// handle. Handles already transferred to a server are not affected;
    /// callers close those independently when the server finishes.
    pub fn close_all(&self) {
        self.unclaimed.lock().unwrap().clear(); // OwnedFd Drop closes them.
        self.resolved.lock().unwrap().clear();
    }

    /// Number of still-unclaimed inherited descriptors, exposed for tests.
    pub fn unclaimed_count(&self) -> usize {
        self.unclaimed.lock().unwrap().len()
    }
}

fn sockaddr_storage_to_std(sa: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = sa.as_sockaddr_in() {
        return Some(SocketAddr::from(sockaddr_in_to_std(v4)));
    }
    if let Some(v6) = sa.as_sockaddr_in6() {
        return Some(SocketAddr::from(sockaddr_in6_to_std(v6)));
    }
    None
}

fn sockaddr_in_to_std(sa: &SockaddrIn) -> std::net::SocketAddrV4 {
    std::net::SocketAddrV4::new(sa.ip(), sa.port())
}

fn sockaddr_in6_to_std(sa: &SockaddrIn6) -> std::net::SocketAddrV6 {
    std::net::SocketAddrV6::new(sa.ip(), sa.port(), 0, 0)
}
