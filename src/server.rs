//! Component D: the minimal contract every accept-and-dispatch loop must
//! satisfy to be owned by the supervisor (spec.md §4.4).

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::listener::{Conn, ListenerHandle};

/// A polymorphic long-running accept/serve loop. Implementors acquire their
/// listeners in `listen`, then block in `serve` until `ctx` is cancelled or
/// an unrecoverable error occurs.
///
/// `async-trait` is used (rather than return-position `impl Trait`) because
/// the supervisor stores a heterogeneous `Vec<Box<dyn Server>>` per
/// generation, which requires the trait to be object-safe.
#[async_trait::async_trait]
pub trait Server: Send + Sync {
    /// Acquires all listeners this server needs. Must be called, and must
    /// succeed, before `serve` is ever invoked.
    async fn listen(&mut self) -> anyhow::Result<()>;

    /// Accepts and dispatches connections until `ctx` is cancelled. Returning
    /// `Ok(())` means clean shutdown (including shutdown triggered by
    /// cancellation); any other `Err` is treated as the server's terminal
    /// failure.
    async fn serve(&self, ctx: CancellationToken) -> anyhow::Result<()>;

    /// Human-readable identifier, including network/address pairs, used by
    /// the supervisor for log lines.
    fn description(&self) -> String;
}

/// Runs one accept loop per listener concurrently, treating cancellation of
/// `ctx` as clean shutdown and surfacing the first other error encountered.
/// A reusable building block for `Server::serve` implementations that don't
/// need custom accept-loop behaviour (spec.md §4.4: "exactly one final error
/// returned after all accept loops have terminated").
pub async fn multi_listener_serve<F, Fut>(
    listeners: &[ListenerHandle],
    ctx: CancellationToken,
    handle_conn: F,
) -> anyhow::Result<()>
where
    F: Fn(Conn, String) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut tasks = tokio::task::JoinSet::new();

    for listener in listeners {
        let listener = listener.clone();
        let ctx = ctx.clone();
        let handle_conn = handle_conn.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Ok(()),
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(conn) => {
                                let desc = listener.local_description();
                                let handler = handle_conn.clone();
                                tokio::spawn(async move { handler(conn, desc).await; });
                            }
                            Err(e) => return Err(anyhow::Error::new(e)),
                        }
                    }
                }
            }
        });
    }

    let mut first_error: Option<anyhow::Error> = None;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if first_error.is_none() => first_error = Some(e),
            Ok(Err(_)) => {}
            Err(join_err) if first_error.is_none() => {
                first_error = Some(anyhow::Error::new(join_err));
            }
            Err(_) => {}
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A server's shared read access to the listener registry, handed to the
/// configurator by the supervisor so it can build servers that resolve their
/// own listener specs during `listen` (spec.md data flow in §2).
pub type RegistryHandle = Arc<crate::listener::Registry>;
