//! Component E: the daemon lifecycle state machine (spec.md §4.5).
//!
//! Grounded on the teacher's `server_main`/`server_main_inner` split
//! (`_teacher_ref/server/mod.rs`): a synchronous setup phase feeding an async
//! body driven by `tokio::select!` over a handful of cancellation/shutdown
//! sources. This module generalises that one-shot shape into the full
//! `Running -> Reloading -> Draining-* -> Terminated` machine spec.md
//! describes, with the spec.md §9 resolution that the supervisor is an
//! explicit value rather than a process-wide singleton: [`Supervisor::spawn`]
//! returns a [`SupervisorHandle`] that signal handlers and other callers hold
//! directly, instead of closing over package-level functions.

mod events;
mod generation;
mod respawn;

pub use generation::Cleanup;

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn, Level};
use tokio::task::JoinHandle;

use crate::error::{ConfigError, DaemonError};
use crate::listener::Registry;
use crate::notify::{take_inherited_fds, Notifier};
use crate::server::Server;

use events::{Event, Mailbox};
use generation::{listen_and_spawn, Generation};

/// `fn(registry) -> (servers, cleanups)`, invoked once per generation. Takes
/// the registry so concrete `Server` implementations can resolve their own
/// listener specs during `Listen` (spec.md §2 data flow; see `server`
/// module's `RegistryHandle` alias).
pub type Configurator = Arc<
    dyn Fn(Arc<Registry>) -> anyhow::Result<(Vec<Box<dyn Server>>, Vec<Cleanup>)> + Send + Sync,
>;

/// Callback for non-fatal errors (spec.md §7, "All non-fatal errors go
/// through a logger callback injected into the supervisor" -- named here as
/// `Logger` since §4.5's option list omits it; see SPEC_FULL.md §4.5).
pub type Logger = Arc<dyn Fn(Level, &str) + Send + Sync>;

fn default_logger() -> Logger {
    Arc::new(|level, message| log::log!(level, "{message}"))
}

/// Options for [`Supervisor::spawn`], mirroring spec.md §4.5's enumerated
/// option list plus the §7/§4.5 logger gap filled in by SPEC_FULL.md.
pub struct Options {
    configurator: Configurator,
    sd_notify_on_ready: bool,
    ready_status: Option<String>,
    signal_parent_on_ready: bool,
    shutdown_timeout: Duration,
    reload_timeout: Duration,
    logger: Logger,
}

impl Options {
    pub fn new(configurator: Configurator) -> Self {
        Self {
            configurator,
            sd_notify_on_ready: false,
            ready_status: None,
            signal_parent_on_ready: false,
            shutdown_timeout: Duration::from_secs(30),
            reload_timeout: Duration::from_secs(30),
            logger: default_logger(),
        }
    }

    pub fn sd_notify_on_ready(mut self, status: Option<impl Into<String>>) -> Self {
        self.sd_notify_on_ready = true;
        self.ready_status = status.map(Into::into);
        self
    }

    pub fn signal_parent_on_ready(mut self) -> Self {
        self.signal_parent_on_ready = true;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = timeout;
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }
}

fn log_non_fatal(logger: &Logger, err: &(dyn std::error::Error + 'static)) {
    logger(Level::Warn, &format!("{err}"));
}

/// A cheap-to-clone reference to a running supervisor. The spec.md §4.5
/// quartet (`Reload`, `Exit`, `Respawn`) lives here as non-blocking methods;
/// a signal dispatcher action closing over one of these is exactly how
/// spec.md §6's "core provides the dispatcher; application sets the mapping"
/// is meant to be wired up (see `daemond-demo`).
#[derive(Clone)]
pub struct SupervisorHandle {
    mailbox: Arc<Mailbox>,
}

impl SupervisorHandle {
    pub fn reload(&self) {
        self.mailbox.post(Event::Reload);
    }

    pub fn respawn(&self) {
        self.mailbox.post(Event::Respawn);
    }

    pub fn exit(&self, graceful: bool) {
        self.mailbox.post(if graceful {
            Event::ExitGraceful
        } else {
            Event::ExitUngraceful
        });
    }
}

/// Runs the lifecycle engine in a spawned task and returns immediately with
/// a handle to it plus a join handle yielding the terminal result (spec.md
/// §4.5 `Run(options…) -> err`, adapted to return control to the caller so
/// it can wire signals into the handle before awaiting termination).
pub fn spawn(options: Options) -> (SupervisorHandle, JoinHandle<Result<(), DaemonError>>) {
    let mailbox = Arc::new(Mailbox::new());
    let handle = SupervisorHandle {
        mailbox: Arc::clone(&mailbox),
    };
    let join = tokio::spawn(run(options, mailbox));
    (handle, join)
}

async fn run(options: Options, mailbox: Arc<Mailbox>) -> Result<(), DaemonError> {
    respawn::acknowledge_if_respawned();

    let registry = Arc::new(Registry::new(take_inherited_fds()));
    let notifier = Notifier::from_env();
    let logger = options.logger.clone();

    let mut generation = match configure_and_listen(0, &options, &registry).await {
        Ok(g) => g,
        Err(e) => {
            registry.close_all();
            return Err(e);
        }
    };

    send_ready(&notifier, &options, &logger);
    if options.signal_parent_on_ready {
        signal_parent_ready(&logger);
    }

    loop {
        match mailbox.recv().await {
            Event::Reload => {
                handle_reload(&mut generation, &options, &registry, &notifier, &logger).await;
            }
            Event::Respawn => {
                if handle_respawn(&generation, &options, &registry, &notifier, &logger).await {
                    let errors = generation.drain(Some(options.shutdown_timeout)).await;
                    return terminal_result(errors);
                }
            }
            Event::ExitGraceful => {
                info!("exit requested, draining gracefully");
                if let Err(e) = notifier.stopping() {
                    log_non_fatal(&logger, &e);
                }
                let errors = generation.drain(Some(options.shutdown_timeout)).await;
                return terminal_result(errors);
            }
            Event::ExitUngraceful => {
                info!("ungraceful exit requested");
                if let Err(e) = notifier.stopping() {
                    log_non_fatal(&logger, &e);
                }
                generation::close_all_listeners(&registry);
                let errors = generation.drain(None).await;
                return terminal_result(errors);
            }
        }
    }
}

async fn configure_and_listen(
    id: u64,
    options: &Options,
    registry: &Arc<Registry>,
) -> Result<Generation, DaemonError> {
    let (servers, cleanups) = (options.configurator)(Arc::clone(registry))
        .map_err(|e| DaemonError::from(ConfigError::Configurator(e)))?;
    let mut generation = listen_and_spawn(id, servers)
        .await
        .map_err(DaemonError::from)?;
    generation.set_cleanups(cleanups);
    Ok(generation)
}

fn send_ready(notifier: &Notifier, options: &Options, logger: &Logger) {
    if !options.sd_notify_on_ready {
        return;
    }
    let result = match &options.ready_status {
        Some(status) => notifier.ready(Some(status.as_str())),
        None => notifier.ready(None),
    };
    if let Err(e) = result {
        log_non_fatal(logger, &e);
    }
}

fn signal_parent_ready(logger: &Logger) {
    let ppid = nix::unistd::getppid();
    if let Err(e) = nix::sys::signal::kill(ppid, nix::sys::signal::Signal::SIGUSR1) {
        logger(
            Level::Warn,
            &format!("failed to signal parent {ppid} on ready: {e}"),
        );
    }
}

/// `Running -> Reloading -> Running` (spec.md §4.5 table). A configurator or
/// listen failure logs and falls back to `Running` on the old generation, per
/// spec.md §7: "logged-and-ignored on reload (old generation continues)".
async fn handle_reload(
    generation: &mut Generation,
    options: &Options,
    registry: &Arc<Registry>,
    notifier: &Notifier,
    logger: &Logger,
) {
    info!("reload requested");
    let (servers, cleanups) = match (options.configurator)(Arc::clone(registry)) {
        Ok(result) => result,
        Err(e) => {
            log_non_fatal(logger, &ConfigError::Configurator(e));
            return;
        }
    };

    if let Err(e) = notifier.reloading() {
        log_non_fatal(logger, &e);
    }

    let mut new_generation = match listen_and_spawn(generation.id + 1, servers).await {
        Ok(g) => g,
        Err(e) => {
            log_non_fatal(logger, &e);
            return;
        }
    };
    new_generation.set_cleanups(cleanups);

    // Listener handles are shared through the registry (spec.md §5: "old
    // listeners... reused by address must not be closed between
    // generations -- the registry preserves them"); swapping which
    // generation owns the accept loop is all that is needed here.
    let old_generation = std::mem::replace(generation, new_generation);
    let errors = old_generation.drain(Some(options.reload_timeout)).await;
    for e in errors {
        log_non_fatal(logger, &*e);
    }

    send_ready(notifier, options, logger);
    info!("reload complete");
}

/// `Running -> Respawning -> {Terminated | Running}`. Returns `true` when the
/// respawn succeeded and the caller should proceed to drain and terminate.
async fn handle_respawn(
    generation: &Generation,
    options: &Options,
    registry: &Arc<Registry>,
    notifier: &Notifier,
    logger: &Logger,
) -> bool {
    info!("respawn requested");
    match respawn::respawn(registry, options.reload_timeout).await {
        Ok(child_pid) => {
            info!(
                "replacement process {child_pid} is ready, handing off {} listener(s)",
                generation.descriptions().len()
            );
            if let Err(e) = notifier.main_pid(child_pid as i32) {
                log_non_fatal(logger, &e);
            }
            if let Err(e) = notifier.stopping() {
                log_non_fatal(logger, &e);
            }
            true
        }
        Err(e) => {
            warn!("respawn failed, resuming as Running: {e}");
            false
        }
    }
}

fn terminal_result(errors: Vec<anyhow::Error>) -> Result<(), DaemonError> {
    let mut errors = errors.into_iter();
    match errors.next() {
        None => Ok(()),
        Some(first) => {
            for remaining in errors {
                error!("additional error during shutdown (not surfaced): {remaining:#}");
            }
            Err(DaemonError::from(crate::error::ServeError {
                description: "generation".to_string(),
                source: first,
            }))
        }
    }
}
