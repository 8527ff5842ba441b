//! Property 1: a listener handed down via the inherited-descriptor protocol
//! resolves to the same underlying socket rather than a fresh bind.
//!
//! Mutates process-global env vars (`LISTEN_PID`/`LISTEN_FDS`/
//! `LISTEN_FDNAMES`) and a fixed low fd number, so this lives in its own
//! test binary (one file = one process in cargo's default test harness)
//! rather than alongside tests that could run concurrently with it.

use std::os::fd::AsRawFd;

use daemond::listener::{Network, Registry};
use daemond::listener::{ListenerSpec, Origin};
use daemond::notify::{take_inherited_fds, SD_LISTEN_FDS_START};

#[test]
fn inherited_fd_resolves_without_rebinding() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let bound_addr = std_listener.local_addr().expect("local_addr");
    let source_fd = std_listener.as_raw_fd();

    // SAFETY: duplicate onto the fd number the inherited-descriptor
    // protocol expects (fd 3), leaving `std_listener`'s own fd independently
    // owned; both point at the same underlying socket in the kernel.
    unsafe {
        libc::dup2(source_fd, SD_LISTEN_FDS_START);
    }

    std::env::set_var("LISTEN_PID", std::process::id().to_string());
    std::env::set_var("LISTEN_FDS", "1");
    std::env::set_var("LISTEN_FDNAMES", "main");

    let inherited = take_inherited_fds();
    assert_eq!(inherited.len(), 1);
    assert_eq!(inherited[0].name, "main");

    // The protocol vars must be unset after parsing regardless of outcome.
    assert!(std::env::var_os("LISTEN_PID").is_none());
    assert!(std::env::var_os("LISTEN_FDS").is_none());
    assert!(std::env::var_os("LISTEN_FDNAMES").is_none());

    let registry = Registry::new(inherited);
    let spec = ListenerSpec::new("main", Network::Tcp, bound_addr.to_string());
    let handle = registry.resolve(&spec).expect("resolve");

    assert_eq!(handle.origin(), Origin::Inherited);
    assert_eq!(registry.unclaimed_count(), 0);

    // `std_listener` still owns the original fd independently of the dup'd
    // copy the registry claimed; dropping it here closes only that copy.
    drop(std_listener);
}
