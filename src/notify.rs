//! Component A: the service-manager notification channel.
//!
//! A thin wrapper over an `AF_UNIX`/`SOCK_DGRAM` socket whose path comes from
//! `NOTIFY_SOCKET`, following the systemd "new-style" daemon notification
//! protocol (spec.md §4.1, §6). Every failure mode here is informational:
//! `notify` never panics and never blocks.

use std::env;
use std::fmt::Write as _;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sys::socket::{
    sendmsg, socket, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::unistd::getpid;
use thiserror::Error;

const NOTIFY_SOCKET_VAR: &str = "NOTIFY_SOCKET";
const LISTEN_PID_VAR: &str = "LISTEN_PID";
const LISTEN_FDS_VAR: &str = "LISTEN_FDS";
const LISTEN_FDNAMES_VAR: &str = "LISTEN_FDNAMES";

/// The first file descriptor number systemd socket activation hands out.
pub const SD_LISTEN_FDS_START: RawFd = 3;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("NOTIFY_SOCKET is not set")]
    NotConfigured,
    #[error("failed to create notify socket: {0}")]
    Socket(#[source] nix::Error),
    #[error("failed to send notify datagram: {0}")]
    Send(#[source] nix::Error),
}

/// Flags controlling a single [`Notifier::notify`] call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyFlags {
    /// Unset `NOTIFY_SOCKET` after a successful send (one-shot semantics).
    pub unset_environment: bool,
}

/// Client for the systemd-style notification socket.
///
/// Constructed once at startup from the environment; every notify call is a
/// best-effort, non-blocking attempt that surfaces failure as `Result` but is
/// never treated as fatal by any call site in this crate.
#[derive(Debug, Clone)]
pub struct Notifier {
    path: Option<Vec<u8>>,
}

impl Notifier {
    /// Reads `NOTIFY_SOCKET` from the environment. Does not unset it; that
    /// only happens on a successful one-shot `notify` call.
    pub fn from_env() -> Self {
        Self {
            path: env::var_os(NOTIFY_SOCKET_VAR).map(|s| s.into_encoded_bytes()),
        }
    }

    /// True if a notify socket is configured (scenario S2 checks the
    /// opposite: when absent, no notify calls are attempted).
    pub fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    fn addr(&self) -> Result<UnixAddr, NotifyError> {
        let path = self.path.as_ref().ok_or(NotifyError::NotConfigured)?;
        // Leading '@' denotes the abstract namespace (spec.md §6).
        if let Some(rest) = path.strip_prefix(b"@") {
            UnixAddr::new_abstract(rest).map_err(NotifyError::Socket)
        } else {
            UnixAddr::new(path.as_slice()).map_err(NotifyError::Socket)
        }
    }

    /// Sends a raw `KEY=VALUE\n`-joined payload with no ancillary data.
    pub fn notify(&self, flags: NotifyFlags, payload: &str) -> Result<(), NotifyError> {
        self.notify_with_fds(flags, payload, &[])
    }

    /// Sends a payload together with file descriptors as `SCM_RIGHTS`
    /// ancillary data on the same datagram (used for `FDSTORE=1`).
    pub fn notify_with_fds(
        &self,
        flags: NotifyFlags,
        payload: &str,
        fds: &[RawFd],
    ) -> Result<(), NotifyError> {
        let addr = self.addr()?;

        let sock = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(NotifyError::Socket)?;

        let iov = [std::io::IoSlice::new(payload.as_bytes())];
        let cmsgs = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };

        sendmsg(
            sock.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            Some(&addr),
        )
        .map_err(NotifyError::Send)?;

        if flags.unset_environment {
            // SAFETY: mutating the process environment is inherently racy if
            // other threads read it concurrently; callers are expected to do
            // this once, early in startup, as systemd daemons conventionally
            // do.
            unsafe { env::remove_var(NOTIFY_SOCKET_VAR) };
        }

        Ok(())
    }

    /// `READY=1` plus an optional human-readable status line.
    pub fn ready(&self, status: Option<&str>) -> Result<(), NotifyError> {
        let mut payload = String::from("READY=1\n");
        if let Some(status) = status {
            let _ = write!(payload, "STATUS={status}\n");
        }
        self.notify(NotifyFlags::default(), &payload)
    }

    pub fn reloading(&self) -> Result<(), NotifyError> {
        self.notify(NotifyFlags::default(), "RELOADING=1\n")
    }

    pub fn stopping(&self) -> Result<(), NotifyError> {
        self.notify(NotifyFlags::default(), "STOPPING=1\n")
    }

    pub fn status(&self, status: &str) -> Result<(), NotifyError> {
        self.notify(NotifyFlags::default(), &format!("STATUS={status}\n"))
    }

    pub fn main_pid(&self, pid: i32) -> Result<(), NotifyError> {
        self.notify(NotifyFlags::default(), &format!("MAINPID={pid}\n"))
    }

    /// `WATCHDOG=1` keepalive ping. The crate does not run a watchdog timer
    /// loop (see SPEC_FULL.md §4.1); callers that need one drive this
    /// themselves on a tick derived from `WATCHDOG_USEC`.
    pub fn watchdog(&self) -> Result<(), NotifyError> {
        self.notify(NotifyFlags::default(), "WATCHDOG=1\n")
    }

    /// Registers file descriptors in the service manager's fd store.
    pub fn fd_store(&self, name: &str, fds: &[RawFd]) -> Result<(), NotifyError> {
        let payload = format!("FDSTORE=1\nFDNAME={name}\n");
        self.notify_with_fds(NotifyFlags::default(), &payload, fds)
    }
}

/// A single descriptor handed down by the service manager, with its optional
/// name from `LISTEN_FDNAMES`.
#[derive(Debug)]
pub struct InheritedFd {
    pub fd: OwnedFd,
    pub name: String,
}

/// Parses `LISTEN_PID`/`LISTEN_FDS`/`LISTEN_FDNAMES` per spec.md §6, then
/// unsets all three so that only an intentional respawn re-inherits them.
///
/// If `LISTEN_PID` is absent, zero, or does not match the current process,
/// every inherited descriptor is ignored (returns an empty vector) without
/// error, matching "ignore everything" in spec.md §4.1/§6.
pub fn take_inherited_fds() -> Vec<InheritedFd> {
    let result = parse_inherited_fds();
    // Unconditionally unset: whether or not we used them, a child process of
    // *this* process must not accidentally re-inherit stale activation state.
    unsafe {
        env::remove_var(LISTEN_PID_VAR);
        env::remove_var(LISTEN_FDS_VAR);
        env::remove_var(LISTEN_FDNAMES_VAR);
    }
    result
}

fn parse_inherited_fds() -> Vec<InheritedFd> {
    let Some(listen_pid) = env::var(LISTEN_PID_VAR)
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
    else {
        return Vec::new();
    };

    if listen_pid != getpid().as_raw() {
        return Vec::new();
    }

    let listen_fds: u32 = env::var(LISTEN_FDS_VAR)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if listen_fds == 0 {
        return Vec::new();
    }

    let names: Vec<String> = env::var(LISTEN_FDNAMES_VAR)
        .map(|s| s.split(':').map(String::from).collect())
        .unwrap_or_default();

    (0..listen_fds)
        .map(|i| {
            let raw_fd = SD_LISTEN_FDS_START + i as RawFd;
            // SAFETY: fds in [3, 3+LISTEN_FDS) are guaranteed open and owned
            // by this process per the socket-activation contract; we take
            // ownership exactly once per fd, here, at startup.
            let owned = unsafe { OwnedFd::from_raw_fd_checked(raw_fd) };
            let name = names
                .get(i as usize)
                .cloned()
                .unwrap_or_else(|| format!("fd{i}"));
            InheritedFd { fd: owned, name }
        })
        .collect()
}

trait FromRawFdChecked {
    /// # Safety
    /// `fd` must be a currently-open, process-owned file descriptor that has
    /// not already been wrapped in an `OwnedFd` elsewhere.
    unsafe fn from_raw_fd_checked(fd: RawFd) -> OwnedFd;
}

impl FromRawFdChecked for OwnedFd {
    unsafe fn from_raw_fd_checked(fd: RawFd) -> OwnedFd {
        use std::os::fd::FromRawFd;
        OwnedFd::from_raw_fd(fd)
    }
}

/// Borrows an already-owned descriptor without taking ownership, for
/// passing to APIs that want a `BorrowedFd` (e.g. `getsockname`-based
/// matching in the listener registry).
pub fn borrow(fd: &OwnedFd) -> BorrowedFd<'_> {
    fd.as_fd()
}
