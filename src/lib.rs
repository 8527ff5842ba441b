//! Core lifecycle engine for long-lived, systemd-aware Unix network
//! daemons: service-manager notification (`notify`), listener
//! activation/inheritance (`listener`), per-connection idle-timeout
//! enforcement (`reaper`), the minimal server contract (`server`), the
//! supervisor state machine (`supervisor`), and the signal dispatcher
//! (`signals`).
//!
//! See `SPEC_FULL.md` for the full component contracts and `DESIGN.md` for
//! how each one maps back to its grounding source.

pub mod error;
pub mod listener;
pub mod notify;
pub mod reaper;
pub mod server;
pub mod signals;
pub mod supervisor;

pub use error::{DaemonError, Result};
pub use supervisor::{Configurator, Logger, Options, SupervisorHandle};
