//! Error taxonomy for the daemon core, grouped by failure category as in
//! spec.md §7. Each category is its own `thiserror` enum; [`DaemonError`]
//! aggregates the ones that can be fatal and is what [`crate::Run`] returns.

use std::io;

/// Errors raised while invoking or re-invoking the user-supplied configurator.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configurator returned an error")]
    Configurator(#[source] anyhow::Error),

    #[error("listener spec '{name}' could not be resolved: {source}")]
    ResolveListener {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised while acquiring listeners for a generation (`Server::listen`).
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("failed to bind {network} listener on {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("inherited descriptor '{name}' is not a valid {network} listener")]
    BadInheritedFd { name: String, network: String },

    #[error("listener spec '{name}' exported twice")]
    DoubleExport { name: String },

    #[error("server '{description}' failed to listen: {source}")]
    Server {
        description: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced from a server's accept loop, other than a clean shutdown.
#[derive(Debug, thiserror::Error)]
#[error("server '{description}' serve loop failed: {source}")]
pub struct ServeError {
    pub description: String,
    #[source]
    pub source: anyhow::Error,
}

/// Errors attempting an in-place respawn. All are non-fatal: the supervisor
/// falls back to `Running` on any of them.
#[derive(Debug, thiserror::Error)]
pub enum RespawnError {
    #[error("failed to export listener descriptors: {0}")]
    Export(#[source] anyhow::Error),

    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[source] io::Error),

    #[error("replacement process did not signal readiness within the reload timeout")]
    ChildNotReady,
}

/// A single cleanup function's failure. Collected, never fatal.
#[derive(Debug, thiserror::Error)]
#[error("cleanup failed: {0}")]
pub struct CleanupError(#[from] pub anyhow::Error);

/// Fatal errors `Run` can return. Notify errors never appear here — they are
/// always logged-and-ignored per spec.md §4.1 and §7.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("configuration failed: {0}")]
    Config(#[from] ConfigError),

    #[error("listener acquisition failed: {0}")]
    Listen(#[from] ListenError),

    #[error(transparent)]
    Serve(#[from] ServeError),
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;
