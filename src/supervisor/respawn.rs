//! In-place respawn: export listening descriptors, fork/exec a replacement
//! process image that inherits them, and wait for it to acknowledge
//! readiness before the parent gives up ownership (spec.md §4.5's
//! `Respawn()` transition; §5's respawn ordering guarantee).
//!
//! spec.md is silent on the transport used for "the child has acknowledged
//! receipt" -- the real `NOTIFY_SOCKET` is the wrong channel for that signal
//! here, since it is meant to run to the *service manager*, not back to a
//! parent that is about to exit. This implementation uses a second,
//! process-private `AF_UNIX`/`SOCK_DGRAM` socket for exactly that one
//! handshake, built from the same primitives as [`crate::notify`].

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{bind, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};
use nix::unistd::{dup2, getpid, Pid};
use thiserror::Error;
use tokio::net::UnixDatagram;

use crate::error::RespawnError;
use crate::listener::Registry;
use crate::notify::SD_LISTEN_FDS_START;

const ACK_ENV_VAR: &str = "DAEMOND_RESPAWN_ACK";
const ACK_PAYLOAD: &[u8] = b"READY=1\n";

#[derive(Debug, Error)]
enum AckSocketError {
    #[error("failed to create respawn ack socket: {0}")]
    Create(#[source] nix::Error),
    #[error("failed to bind respawn ack socket at {0}: {1}")]
    Bind(PathBuf, #[source] nix::Error),
}

/// Exports the registry's listeners, forks a replacement process inheriting
/// them (plus `LISTEN_PID`/`LISTEN_FDS`/`LISTEN_FDNAMES`), and blocks
/// (asynchronously) until it either sends its readiness ack or
/// `reload_timeout` elapses. On success, returns the child's pid so the
/// caller can forward `MAINPID=<pid>` to the real service manager.
pub(crate) async fn respawn(
    registry: &Registry,
    reload_timeout: Duration,
) -> Result<u32, RespawnError> {
    let exported = registry.export().map_err(|e| RespawnError::Export(anyhow::Error::new(e)))?;
    let exported_names: Vec<String> = exported.iter().map(|(_, name)| name.clone()).collect();

    // From here on, any failure must unmark `exported_names` before
    // returning: the parent stays in `Running` on its own registry, and a
    // later `Respawn()` attempt needs to be able to export them again
    // (spec.md §7, "child not ready in time" falls back to `Running`).
    let rollback = |registry: &Registry| registry.unexport(&exported_names);

    let ack_dir = std::env::temp_dir();
    let ack_path = ack_dir.join(format!("daemond-respawn-ack-{}.sock", getpid()));
    let _ = std::fs::remove_file(&ack_path);
    let ack_sock = match bind_ack_socket(&ack_path) {
        Ok(sock) => sock,
        Err(e) => {
            rollback(registry);
            return Err(RespawnError::Export(anyhow::Error::new(e)));
        }
    };

    let mut command = build_command(&exported);
    command.env(ACK_ENV_VAR, &ack_path);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = std::fs::remove_file(&ack_path);
            rollback(registry);
            return Err(RespawnError::Spawn(e));
        }
    };
    let child_pid = child.id();

    let ack_result = wait_for_ack(ack_sock, reload_timeout).await;
    let _ = std::fs::remove_file(&ack_path);

    match ack_result {
        Ok(()) => Ok(child_pid),
        Err(()) => {
            // Best-effort: the child never acknowledged readiness in time.
            // It may have already bound/inherited the listeners, so the
            // parent cannot simply keep using them; terminate the orphan
            // and let `Running` continue on the registry it still holds.
            // SAFETY: `child_pid` came from our own just-spawned child.
            let _ = nix::sys::signal::kill(Pid::from_raw(child_pid as i32), nix::sys::signal::Signal::SIGTERM);
            rollback(registry);
            Err(RespawnError::ChildNotReady)
        }
    }
}

fn build_command(exported: &[(RawFd, String)]) -> Command {
    // `/proc/self/exe` is a reasonable fallback on the only platform this
    // crate targets if the canonical lookup fails.
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/proc/self/exe"));
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

    let mut command = Command::new(exe);
    command.args(&args);
    command.env("LISTEN_FDS", exported.len().to_string());
    command.env(
        "LISTEN_FDNAMES",
        exported
            .iter()
            .map(|(_, name)| name.as_str())
            .collect::<Vec<_>>()
            .join(":"),
    );

    let source_fds: Vec<RawFd> = exported.iter().map(|(fd, _)| *fd).collect();
    // SAFETY: this closure runs in the forked child, single-threaded,
    // strictly before `execve`. It only calls `dup2`/`fcntl`/`setenv`-class
    // operations, which is the conventional (if not strictly
    // async-signal-safe per POSIX) way to wire up descriptor inheritance
    // and `LISTEN_PID` for a child whose own pid isn't known until after
    // `fork()`.
    unsafe {
        command.pre_exec(move || {
            for (i, &src) in source_fds.iter().enumerate() {
                let dst = SD_LISTEN_FDS_START + i as RawFd;
                if src != dst {
                    dup2(src, dst).map_err(io::Error::from)?;
                }
                let flags = fcntl(dst, FcntlArg::F_GETFD).map_err(io::Error::from)?;
                let flags = FdFlag::from_bits_truncate(flags) & !FdFlag::FD_CLOEXEC;
                fcntl(dst, FcntlArg::F_SETFD(flags)).map_err(io::Error::from)?;
            }
            std::env::set_var("LISTEN_PID", getpid().to_string());
            Ok(())
        });
    }

    command
}

fn bind_ack_socket(path: &PathBuf) -> Result<std::os::unix::net::UnixDatagram, AckSocketError> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(AckSocketError::Create)?;
    let addr = UnixAddr::new(path).map_err(AckSocketError::Create)?;
    bind(sock.as_raw_fd(), &addr).map_err(|e| AckSocketError::Bind(path.clone(), e))?;
    Ok(std::os::unix::net::UnixDatagram::from(sock))
}

async fn wait_for_ack(std_sock: std::os::unix::net::UnixDatagram, timeout: Duration) -> Result<(), ()> {
    let sock = UnixDatagram::from_std(std_sock).map_err(|_| ())?;
    let mut buf = [0u8; 64];
    tokio::time::timeout(timeout, sock.recv(&mut buf))
        .await
        .map(|_| ())
        .map_err(|_| ())
}

/// Called once at startup: if this process was exec'd by a parent's
/// `Respawn()`, sends the readiness ack and removes the env var so a
/// subsequent respawn of *this* process doesn't accidentally reuse it.
pub(crate) fn acknowledge_if_respawned() {
    let Some(ack_path) = std::env::var_os(ACK_ENV_VAR) else {
        return;
    };
    // SAFETY: mutating the process environment is inherently racy if other
    // threads read it concurrently; called once, early in startup, before
    // anything else could plausibly read this crate-private variable.
    unsafe { std::env::remove_var(ACK_ENV_VAR) };

    let sock = match socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(s) => s,
        Err(_) => return,
    };
    let addr = match UnixAddr::new(ack_path.as_os_str()) {
        Ok(a) => a,
        Err(_) => return,
    };
    let _ = nix::sys::socket::sendto(sock.as_raw_fd(), ACK_PAYLOAD, &addr, MsgFlags::MSG_NOSIGNAL);
}
