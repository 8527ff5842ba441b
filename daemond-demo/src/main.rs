//! Demonstrates spec.md §8 scenarios S1 (basic lifecycle, reload), S2
//! (`NOTIFY_SOCKET` unset) and S5 (respawn) end to end: one TCP listener
//! replying with its generation number, reloaded on `SIGHUP`, replaced
//! in-place on `SIGUSR2`, and shut down on `SIGINT`/`SIGTERM`.

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use daemond::listener::{ListenerHandle, ListenerSpec, Network, Registry};
use daemond::server::{multi_listener_serve, Server};
use daemond::signals::{Dispatcher, Signal};
use daemond::supervisor::{self, Cleanup, Options};
use daemond::DaemonError;

struct RevServer {
    registry: Arc<Registry>,
    spec: ListenerSpec,
    reply: Arc<str>,
    listener: Option<ListenerHandle>,
}

impl RevServer {
    fn new(registry: Arc<Registry>, spec: ListenerSpec, reply: Arc<str>) -> Self {
        Self {
            registry,
            spec,
            reply,
            listener: None,
        }
    }
}

#[async_trait::async_trait]
impl Server for RevServer {
    async fn listen(&mut self) -> anyhow::Result<()> {
        let handle = self.registry.resolve(&self.spec)?;
        log::info!("{} listening on {}", self.description(), self.spec.address);
        self.listener = Some(handle);
        Ok(())
    }

    async fn serve(&self, ctx: CancellationToken) -> anyhow::Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Err(anyhow::anyhow!("serve called before listen"));
        };
        let reply = Arc::clone(&self.reply);
        multi_listener_serve(
            std::slice::from_ref(&listener),
            ctx,
            move |mut conn, _peer_description| {
                let reply = Arc::clone(&reply);
                async move {
                    if let Err(e) = conn.write_all(reply.as_bytes()).await {
                        log::warn!("write failed: {e}");
                        return;
                    }
                    let _ = conn.shutdown().await;
                }
            },
        )
        .await
    }

    fn description(&self) -> String {
        format!("rev-server({})", self.spec.address)
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run())
}

async fn run() -> ExitCode {
    let generation = Arc::new(AtomicU64::new(0));

    let configurator: daemond::Configurator = Arc::new(move |registry: Arc<Registry>| {
        let gen_id = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reply: Arc<str> = Arc::from(format!("rev={gen_id}\n"));
        let spec = ListenerSpec::new("main", Network::Tcp, "127.0.0.1:4321");
        let server: Box<dyn Server> = Box::new(RevServer::new(Arc::clone(&registry), spec, reply));

        let cleanup: Cleanup = Box::new(move || {
            log::info!("generation {gen_id} cleaned up");
            Ok(())
        });

        Ok((vec![server], vec![cleanup]))
    });

    let options = Options::new(configurator)
        .sd_notify_on_ready(Some("serving"))
        .shutdown_timeout(Duration::from_secs(10))
        .reload_timeout(Duration::from_secs(10));

    let (handle, join) = supervisor::spawn(options);

    let dispatcher = Dispatcher::builder()
        .on(Signal::Int, {
            let h = handle.clone();
            move || h.exit(false)
        })
        .on(Signal::Term, {
            let h = handle.clone();
            move || h.exit(true)
        })
        .on(Signal::Hup, {
            let h = handle.clone();
            move || h.reload()
        })
        .on(Signal::Usr2, {
            let h = handle.clone();
            move || h.respawn()
        })
        .spawn();

    let dispatcher = match dispatcher {
        Ok(d) => d,
        Err(e) => {
            log::error!("failed to install signal handlers: {e}");
            return ExitCode::from(1);
        }
    };

    let result = join.await;
    dispatcher.shutdown();

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            log::error!("daemon exited with error: {e:#}");
            exit_code_for(&e)
        }
        Err(join_err) => {
            log::error!("supervisor task panicked: {join_err}");
            ExitCode::from(1)
        }
    }
}

/// spec.md §6: "non-zero with a documented distinction between configurator
/// failed, listen failed, and serve failed."
fn exit_code_for(err: &DaemonError) -> ExitCode {
    match err {
        DaemonError::Config(_) => ExitCode::from(1),
        DaemonError::Listen(_) => ExitCode::from(2),
        DaemonError::Serve(_) => ExitCode::from(3),
    }
}
