//! Process-wide registry of named servers.
//!
//! # Responsibilities
//! - Create servers on first use and look them up by name
//! - Track restarts in flight
//! - Fire the completion signal once every server has stopped
//!
//! # Design Decisions
//! - One explicit object, passed to whoever needs name lookup; there is no
//!   global instance
//! - Completion waits for restarts in flight: a handoff drains the old
//!   servers while its restart is still being finalized

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::http::Server;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::state::ServerState;

#[derive(Debug)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<Server>>,
    grace: Duration,
    pending_restarts: AtomicUsize,
    changed: Notify,
    completion: Shutdown,
}

impl ServerRegistry {
    /// `grace` bounds the drain of every server created here.
    pub fn new(grace: Duration) -> Self {
        Self {
            servers: DashMap::new(),
            grace,
            pending_restarts: AtomicUsize::new(0),
            changed: Notify::new(),
            completion: Shutdown::new(),
        }
    }

    /// The server named by `config`, created if it does not exist yet. An
    /// existing server keeps its original configuration.
    pub fn get_or_create(&self, config: ServerConfig) -> Arc<Server> {
        let server = self
            .servers
            .entry(config.name.clone())
            .or_insert_with(|| {
                tracing::debug!(server = %config.name, "Server created");
                Arc::new(Server::new(config, self.grace))
            })
            .value()
            .clone();
        self.changed.notify_waiters();
        server
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// All servers, ordered by name.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        let mut servers: Vec<_> = self.servers.iter().map(|e| Arc::clone(e.value())).collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));
        servers
    }

    pub fn names(&self) -> Vec<String> {
        self.servers().iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Mark a restart in flight until the guard drops.
    pub fn begin_restart(self: &Arc<Self>) -> RestartGuard {
        self.pending_restarts.fetch_add(1, Ordering::SeqCst);
        RestartGuard {
            registry: Arc::clone(self),
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.pending_restarts.load(Ordering::SeqCst) > 0
    }

    fn all_stopped(&self) -> bool {
        self.servers.iter().all(|e| e.value().state() == ServerState::Stopped)
    }

    /// Block until every server is Stopped with no restart in flight, then
    /// fire the completion signal.
    pub async fn run_until_stopped(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            for server in self.servers() {
                server.state_machine().wait_for(|s| s == ServerState::Stopped).await;
            }
            if !self.restart_pending() && self.all_stopped() {
                break;
            }
            changed.await;
        }
        tracing::info!(servers = self.len(), "All servers stopped");
        self.completion.trigger();
    }

    /// Resolves once the completion signal fired.
    pub async fn stopped(&self) {
        self.completion.wait().await
    }

    pub fn is_stopped(&self) -> bool {
        self.completion.is_triggered()
    }
}

/// Keeps the completion signal from firing while a restart is in flight.
#[derive(Debug)]
pub struct RestartGuard {
    registry: Arc<ServerRegistry>,
}

impl Drop for RestartGuard {
    fn drop(&mut self) {
        self.registry.pending_restarts.fetch_sub(1, Ordering::SeqCst);
        self.registry.changed.notify_waiters();
    }
}
