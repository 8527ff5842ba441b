//! One full set of servers produced by a single configurator invocation
//! (spec.md §4.5, GLOSSARY "Generation"), and the logic to bring it up and
//! drain it down.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{CleanupError, ListenError};
use crate::listener::Registry;
use crate::server::Server;

pub type Cleanup = Box<dyn FnOnce() -> anyhow::Result<()> + Send + Sync>;

pub(crate) struct Generation {
    pub(crate) id: u64,
    pub(crate) ctx: CancellationToken,
    servers: Vec<Arc<dyn Server>>,
    cleanups: Vec<Cleanup>,
    serve_tasks: JoinSet<(String, anyhow::Result<()>)>,
}

/// Calls `Listen` on every server in turn, then spawns one `Serve` task per
/// server sharing a single generation-scoped cancellation token (spec.md §5,
/// "a single generation-scoped cancellation token passed into each Serve").
///
/// On a `Listen` failure, already-listening servers in this batch are left
/// as-is: their listeners stay registered so a subsequent attempt (or the
/// caller's own `close_all`) can reuse or release them, matching spec.md
/// §7's "fatal at first generation; logged-and-ignored on reload" split --
/// which of those two this failure means is the caller's decision, not
/// this function's.
pub(crate) async fn listen_and_spawn(
    id: u64,
    mut servers: Vec<Box<dyn Server>>,
) -> Result<Generation, ListenError> {
    for server in servers.iter_mut() {
        server.listen().await.map_err(|source| ListenError::Server {
            description: server.description(),
            source,
        })?;
    }

    let ctx = CancellationToken::new();
    let servers: Vec<Arc<dyn Server>> = servers.into_iter().map(Arc::from).collect();
    let mut serve_tasks = JoinSet::new();
    for server in &servers {
        let server = Arc::clone(server);
        let ctx = ctx.clone();
        serve_tasks.spawn(async move {
            let description = server.description();
            let result = server.serve(ctx).await;
            (description, result)
        });
    }

    Ok(Generation {
        id,
        ctx,
        servers,
        cleanups: Vec::new(),
        serve_tasks,
    })
}

impl Generation {
    pub(crate) fn set_cleanups(&mut self, cleanups: Vec<Cleanup>) {
        self.cleanups = cleanups;
    }

    pub(crate) fn descriptions(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.description()).collect()
    }

    /// Cancels this generation's servers and waits for every `Serve` task to
    /// return, bounded by `timeout` when given. On timeout, remaining tasks
    /// are aborted rather than joined. Runs this generation's cleanups
    /// afterward regardless of how draining ended, collecting (not
    /// propagating) their errors, per spec.md §4.5 "Cleanups... Errors are
    /// collected, not fatal."
    ///
    /// Returns every `Serve` error encountered, in completion order, plus
    /// every `Cleanup` error appended at the end.
    pub(crate) async fn drain(mut self, timeout: Option<Duration>) -> Vec<anyhow::Error> {
        self.ctx.cancel();

        let mut errors = Vec::new();
        let join_all = async {
            while let Some(result) = self.serve_tasks.join_next().await {
                match result {
                    Ok((_, Ok(()))) => {}
                    Ok((description, Err(e))) => {
                        errors.push(anyhow::Error::new(crate::error::ServeError {
                            description,
                            source: e,
                        }));
                    }
                    Err(join_err) => errors.push(anyhow::Error::new(join_err)),
                }
            }
        };

        match timeout {
            Some(bound) => {
                if tokio::time::timeout(bound, join_all).await.is_err() {
                    warn!(
                        "generation {} did not finish draining within {:?}; aborting remaining serve tasks",
                        self.id, bound
                    );
                    self.serve_tasks.abort_all();
                }
            }
            None => join_all.await,
        }

        for cleanup in self.cleanups {
            if let Err(e) = cleanup() {
                errors.push(anyhow::Error::new(CleanupError(e)));
            }
        }

        errors
    }
}

/// Closes every listener this registry still holds. Used on the ungraceful
/// exit path to force any accept loop that isn't already honouring
/// cancellation to unblock (spec.md §4.5 "close listeners immediately").
pub(crate) fn close_all_listeners(registry: &Registry) {
    registry.close_all();
}
