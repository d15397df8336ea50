//! Restart, reload and shutdown for every server of the process.
//!
//! # Responsibilities
//! - Hand listening sockets to a freshly spawned successor (restart)
//! - Swap route tables in place, or escalate to a restart (reload)
//! - Drain every server (shutdown)
//! - Maintain the pid file
//!
//! # Data Flow
//! ```text
//! Restart (handoff):
//!     snapshot listeners → renumber from fd 3 → spawn successor
//!         → wait for "ready" on the control pipe
//!         → ok: drain every server        err: kill successor, keep serving
//!
//! Restart (hard, no descriptor inheritance):
//!     release listeners → spawn successor → wait for "ready"
//!         → ok: drain every server        err: kill successor, rebind
//! ```
//!
//! # Design Decisions
//! - One restart or reload at a time; a second request fails fast with
//!   `RestartInProgress` instead of queueing
//! - The predecessor never drains before the successor reported ready
//! - The successor reads its own configuration file; only sockets and
//!   spawn metadata cross the process boundary

use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::join_all;
use tokio::sync::Mutex;

use crate::cli::Cli;
use crate::config::GraceConfig;
use crate::error::ServerError;
use crate::http::Server;
use crate::lifecycle::fdmap::{Handoff, FDMAP_ENV};
use crate::lifecycle::state::ServerState;
use crate::net::inherit::{self, Descriptor, FIRST_INHERITED};
use crate::observability::metrics;
use crate::registry::ServerRegistry;

/// How a restart moves listeners to the successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Listening sockets are inherited; no connection is refused.
    Handoff,
    /// Sockets are closed first and the successor binds afresh.
    Hard,
}

/// A spawned successor that has not confirmed readiness yet.
struct Successor {
    child: Child,
    #[cfg(unix)]
    ready: std::io::PipeReader,
}

#[derive(Debug)]
pub struct ProcessCoordinator {
    registry: Arc<ServerRegistry>,
    config: RwLock<GraceConfig>,
    cli: Cli,
    restart_lock: Mutex<()>,
}

impl ProcessCoordinator {
    pub fn new(registry: Arc<ServerRegistry>, config: GraceConfig, cli: Cli) -> Self {
        Self {
            registry,
            config: RwLock::new(config),
            cli,
            restart_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Snapshot of the configuration currently in effect.
    pub fn config(&self) -> GraceConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn restart_mode(&self) -> RestartMode {
        if inherit::inheritance_supported() && self.config().process.inherit_descriptors {
            RestartMode::Handoff
        } else {
            RestartMode::Hard
        }
    }

    /// Every live listener, renumbered as the successor will see it.
    /// Returns the handoff map and the local descriptors in child order.
    pub fn snapshot(&self) -> (Handoff, Vec<Descriptor>) {
        let mut handoff = Handoff::default();
        let mut sources = Vec::new();
        for server in self.registry.servers() {
            if server.state() != ServerState::Running {
                continue;
            }
            for source in server.handoff_sources() {
                let target = FIRST_INHERITED + sources.len() as Descriptor;
                handoff
                    .server_mut(server.name())
                    .push(source.secure, &source.address, target);
                sources.push(source.descriptor);
            }
        }
        (handoff, sources)
    }

    /// Replace this process with a successor. Returns once the successor
    /// reported ready and every local server drained, or with the error
    /// that made the restart fail while this process keeps serving.
    pub async fn restart(&self) -> Result<(), ServerError> {
        let _lock = self
            .restart_lock
            .try_lock()
            .map_err(|_| ServerError::RestartInProgress)?;
        let _pending = self.registry.begin_restart();

        let result = match self.restart_mode() {
            RestartMode::Handoff => self.handoff_restart().await,
            RestartMode::Hard => {
                if !inherit::inheritance_supported() {
                    tracing::warn!(
                        error = %ServerError::DescriptorInheritanceUnsupported,
                        "Falling back to hard restart"
                    );
                } else {
                    tracing::warn!("Descriptor inheritance disabled, falling back to hard restart");
                }
                self.hard_restart().await
            }
        };

        match &result {
            Ok(()) => metrics::record_restart("restarted"),
            Err(e) => {
                metrics::record_restart("failed");
                tracing::error!(error = %e, "Restart failed, still serving");
            }
        }
        result
    }

    async fn handoff_restart(&self) -> Result<(), ServerError> {
        let (handoff, sources) = self.snapshot();
        tracing::info!(
            servers = handoff.servers.len(),
            descriptors = sources.len(),
            "Handing listeners to successor"
        );

        let successor = self.spawn_successor(Some(&handoff), &sources)?;
        self.await_successor(successor).await?;
        self.drain_all().await;
        Ok(())
    }

    async fn hard_restart(&self) -> Result<(), ServerError> {
        let servers = self.running_servers();
        join_all(servers.iter().map(|s| s.release())).await;

        let outcome = match self.spawn_successor(None, &[]) {
            Ok(successor) => self.await_successor(successor).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            for server in &servers {
                if let Err(rebind) = server.rebind().await {
                    tracing::error!(server = %server.name(), error = %rebind, "Failed to rebind after failed restart");
                }
            }
            return Err(e);
        }
        self.drain_all().await;
        Ok(())
    }

    fn spawn_successor(
        &self,
        handoff: Option<&Handoff>,
        sources: &[Descriptor],
    ) -> Result<Successor, ServerError> {
        let exe = std::env::current_exe()
            .map_err(|e| ServerError::Successor(format!("cannot locate executable: {e}")))?;

        let mut cli = Cli::for_spawn(self.cli.config.clone());
        cli.topid = self.cli.topid;
        let mut cmd = Command::new(exe);
        cmd.env_remove(FDMAP_ENV);

        if let Some(handoff) = handoff {
            cli.name = handoff.servers.keys().cloned().collect();
            cli.fcount = Some(handoff.descriptor_count());
            let encoded = handoff
                .encode()
                .map_err(|e| ServerError::Successor(format!("cannot encode handoff: {e}")))?;
            cmd.env(FDMAP_ENV, encoded);
        }

        launch(cmd, cli, sources)
    }

    async fn await_successor(&self, successor: Successor) -> Result<(), ServerError> {
        let timeout = self.config().process.successor_ready_timeout();
        #[cfg(unix)]
        let Successor { mut child, ready } = successor;
        #[cfg(unix)]
        let outcome = crate::lifecycle::readiness::wait_ready(ready, timeout).await;

        #[cfg(not(unix))]
        let Successor { mut child } = successor;
        #[cfg(not(unix))]
        let outcome = wait_alive(&mut child, timeout).await;

        match outcome {
            Ok(()) => {
                tracing::info!(pid = child.id(), "Successor ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(pid = child.id(), error = %e, "Successor not ready, terminating it");
                let _ = child.kill();
                let _ = tokio::task::spawn_blocking(move || child.wait()).await;
                Err(e)
            }
        }
    }

    /// Apply a new configuration, or rebuild route tables in place when
    /// `config` is `None`. Server settings that do not touch listeners
    /// (cache capacity, request timeout, drain grace) are applied to the
    /// running servers. Escalates to a restart when listeners or logging
    /// changed, or a server cannot reload itself.
    pub async fn reload(&self, config: Option<GraceConfig>) -> Result<(), ServerError> {
        let lock = self
            .restart_lock
            .try_lock()
            .map_err(|_| ServerError::RestartInProgress)?;

        let mut escalate = false;
        if let Some(next) = &config {
            escalate = self.requires_restart(next);
            *self.config.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        }
        let servers = self.running_servers();
        if let Some(server) = servers.iter().find(|s| !s.has_reloader()) {
            tracing::info!(server = %server.name(), "No reloader registered, restarting instead");
            escalate = true;
        }
        if escalate {
            drop(lock);
            return self.restart().await;
        }

        let grace = self.config().process.graceful_timeout();
        let mut result = Ok(());
        for server in &servers {
            let outcome = match config.as_ref().and_then(|c| c.server(server.name())) {
                Some(next) => server.reconfigure(next.clone(), grace),
                None => server.reload(),
            };
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        metrics::record_restart(if result.is_ok() { "reloaded" } else { "failed" });
        result
    }

    /// True when `next` cannot be applied in place: it binds different
    /// listeners, names another set of servers, or changes logging and
    /// metrics, which are set up once per process.
    pub fn requires_restart(&self, next: &GraceConfig) -> bool {
        let current = self.config();
        if current.servers.len() != next.servers.len() || current.observability != next.observability {
            return true;
        }
        current.servers.iter().any(|server| match next.server(&server.name) {
            Some(other) => !server.same_listeners(other),
            None => true,
        })
    }

    /// Drain every server and remove the pid file.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let _lock = self.restart_lock.lock().await;
        tracing::info!("Shutting down");
        self.drain_all().await;
        self.remove_pid_file();
        Ok(())
    }

    /// Record this process id in the configured pid file.
    pub fn write_pid_file(&self) -> std::io::Result<()> {
        if let Some(path) = self.pid_file() {
            std::fs::write(&path, format!("{}\n", std::process::id()))?;
            tracing::debug!(path = %path.display(), "Pid file written");
        }
        Ok(())
    }

    /// Remove the pid file unless a successor already took it over.
    fn remove_pid_file(&self) {
        let Some(path) = self.pid_file() else { return };
        let ours = std::fs::read_to_string(&path)
            .map(|content| content.trim() == std::process::id().to_string())
            .unwrap_or(false);
        if ours {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }

    fn pid_file(&self) -> Option<PathBuf> {
        self.config().process.pid_file
    }

    fn running_servers(&self) -> Vec<Arc<Server>> {
        self.registry
            .servers()
            .into_iter()
            .filter(|s| s.state() == ServerState::Running)
            .collect()
    }

    async fn drain_all(&self) {
        let servers = self.running_servers();
        let results = join_all(servers.iter().map(|s| s.drain())).await;
        for (server, result) in servers.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(server = %server.name(), error = %e, "Drain failed");
            }
        }
    }
}

/// Spawn with `sources` plus the write end of a fresh readiness pipe as
/// inherited descriptors.
#[cfg(unix)]
fn launch(mut cmd: Command, mut cli: Cli, sources: &[Descriptor]) -> Result<Successor, ServerError> {
    use std::os::fd::AsRawFd;

    let (ready, control) = std::io::pipe()?;
    let mut inherited = sources.to_vec();
    inherited.push(control.as_raw_fd());
    cli.control_fd = Some(FIRST_INHERITED + sources.len() as Descriptor);
    inherit::install(&mut cmd, &inherited);
    cmd.args(cli.to_args());

    let child = cmd
        .spawn()
        .map_err(|e| ServerError::Successor(format!("spawn failed: {e}")))?;
    // Only the successor may hold the write end, so its exit reads as EOF.
    drop(control);
    tracing::info!(pid = child.id(), "Successor spawned");
    Ok(Successor { child, ready })
}

#[cfg(not(unix))]
fn launch(mut cmd: Command, cli: Cli, _sources: &[Descriptor]) -> Result<Successor, ServerError> {
    cmd.args(cli.to_args());
    let child = cmd
        .spawn()
        .map_err(|e| ServerError::Successor(format!("spawn failed: {e}")))?;
    tracing::info!(pid = child.id(), "Successor spawned");
    Ok(Successor { child })
}

/// Without a control pipe, a successor that is still alive when the
/// timeout ends counts as ready.
#[cfg(not(unix))]
async fn wait_alive(child: &mut Child, timeout: std::time::Duration) -> Result<(), ServerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Err(ServerError::Successor(format!("successor exited with {status}")));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Ok(())
}
