//! Worker process entry point.
//!
//! # Data Flow
//! ```text
//! register signal handlers
//!     → take FdMap from the environment (validated against --fcount/--name)
//!     → per configured server: create, install routes, start on inherited
//!       or fresh sockets
//!     → report ready to the predecessor, write pid file
//!     → serve until every server stopped
//! ```
//!
//! # Design Decisions
//! - Signal handlers are installed before readiness is reported, so a
//!   restart requested right after the handoff is never lost
//! - A handoff that does not match the spawn metadata is discarded and its
//!   descriptors closed; the worker then binds afresh
//! - Route setup doubles as each server's reloader and always sees the
//!   server's current configuration

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cli::Cli;
use crate::config::validation::ValidationError;
use crate::config::watcher::ConfigWatcher;
use crate::config::{ConfigError, GraceConfig, ServerConfig};
use crate::error::ServerError;
use crate::http::RouteTable;
use crate::lifecycle::fdmap::Handoff;
use crate::lifecycle::readiness::ReadinessNotifier;
use crate::lifecycle::signals::{ProcessSignal, Signals};
use crate::lifecycle::state::ServerState;
use crate::lifecycle::ProcessCoordinator;
use crate::net::inherit::{self, Descriptor, FIRST_INHERITED};
use crate::observability::metrics;
use crate::registry::ServerRegistry;

/// Installs a server's routes into a route table. Called at startup and
/// again on every hot reload.
pub type RouteSetup = Arc<dyn Fn(&ServerConfig, &RouteTable) -> Result<(), ServerError> + Send + Sync>;

/// Run this process as a worker until every server stopped.
pub async fn run_worker(cli: Cli, config: GraceConfig, setup: RouteSetup) -> Result<(), ServerError> {
    let mut signals = Signals::new()?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let notifier = match cli.control_fd {
        Some(descriptor) => ReadinessNotifier::from_descriptor(descriptor).unwrap_or_else(|e| {
            tracing::warn!(descriptor, error = %e, "Control descriptor unusable");
            ReadinessNotifier::none()
        }),
        None => ReadinessNotifier::none(),
    };
    let handoff = accept_handoff(&cli, &config);

    let registry = Arc::new(ServerRegistry::new(config.process.graceful_timeout()));
    let started = start_servers(&registry, &config, handoff.as_ref(), &setup).await?;
    tracing::info!(servers = started, inherited = handoff.is_some(), "Worker ready");

    let coordinator = Arc::new(ProcessCoordinator::new(Arc::clone(&registry), config, cli.clone()));
    if let Err(e) = notifier.notify() {
        tracing::warn!(error = %e, "Failed to report readiness");
    }
    if let Err(e) = coordinator.write_pid_file() {
        tracing::warn!(error = %e, "Failed to write pid file");
    }

    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                let signal = signals.recv().await;
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { dispatch_signal(&coordinator, signal).await });
            }
        });
    }

    let _watcher = if cli.config.exists() {
        let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                if let Err(e) = coordinator.reload(Some(config)).await {
                    tracing::warn!(error = %e, "Configuration change not applied");
                }
            }
        });
        watcher
            .run()
            .map_err(|e| tracing::warn!(error = %e, "Config watcher disabled"))
            .ok()
    } else {
        None
    };

    registry.run_until_stopped().await;
    Ok(())
}

async fn dispatch_signal(coordinator: &ProcessCoordinator, signal: ProcessSignal) {
    let result = match signal {
        ProcessSignal::Restart => coordinator.restart().await,
        ProcessSignal::Reload => coordinator.reload(None).await,
        ProcessSignal::Shutdown => coordinator.shutdown().await,
    };
    if let Err(e) = result {
        tracing::warn!(signal = ?signal, error = %e, "Signal handling failed");
    }
}

/// Create every configured server, install its routes and start it.
/// Returns how many servers are Running; fails when none is.
pub async fn start_servers(
    registry: &ServerRegistry,
    config: &GraceConfig,
    handoff: Option<&Handoff>,
    setup: &RouteSetup,
) -> Result<usize, ServerError> {
    let mut first_error = None;
    for server_config in &config.servers {
        let server = registry.get_or_create(server_config.clone());
        let reload_setup = Arc::clone(setup);
        let handle = Arc::downgrade(&server);
        let inherited = handoff.and_then(|h| h.server(server.name()));
        // Routes are always built for the configuration the server holds now,
        // which a reload may have replaced.
        let reloader = move |table: &RouteTable| match handle.upgrade() {
            Some(server) => reload_setup(&server.config(), table),
            None => Ok(()),
        };
        if let Err(e) = server.set_reloader(reloader) {
            tracing::error!(server = %server.name(), error = %e, "Route setup failed");
            for entry in inherited.into_iter().flat_map(|map| map.entries()).flatten() {
                inherit::release(entry.descriptor);
            }
            first_error.get_or_insert(e);
            continue;
        }

        if let Err(e) = server.start(inherited).await {
            first_error.get_or_insert(e);
        }
    }

    let running = registry
        .servers()
        .iter()
        .filter(|s| s.state() == ServerState::Running)
        .count();
    match (running, first_error) {
        (0, Some(e)) => Err(e),
        (0, None) => Err(ConfigError::Validation(vec![ValidationError::NoServers]).into()),
        (running, _) => Ok(running),
    }
}

/// The handoff left by a predecessor, if it matches the spawn metadata.
/// Mismatched handoffs are discarded with their descriptors closed.
pub fn accept_handoff(cli: &Cli, config: &GraceConfig) -> Option<Handoff> {
    let declared = cli.fcount.unwrap_or(0);
    let handoff = match Handoff::read_from_env() {
        None => {
            release_declared(declared);
            return None;
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Malformed FdMap, binding fresh sockets");
            release_declared(declared);
            return None;
        }
        Some(Ok(handoff)) => handoff,
    };

    if handoff.descriptor_count() != declared {
        tracing::warn!(
            declared,
            found = handoff.descriptor_count(),
            "FdMap does not match descriptor count, binding fresh sockets"
        );
        release_declared(declared);
        return None;
    }
    let listed: BTreeSet<&str> = cli.name.iter().map(String::as_str).collect();
    let present: BTreeSet<&str> = handoff.servers.keys().map(String::as_str).collect();
    if listed != present {
        tracing::warn!(?listed, ?present, "FdMap does not match server names, binding fresh sockets");
        release_declared(declared);
        return None;
    }

    for (name, map) in &handoff.servers {
        if config.server(name).is_some() {
            continue;
        }
        tracing::warn!(server = %name, "Inherited listeners of unconfigured server closed");
        for entry in map.entries().into_iter().flatten() {
            inherit::release(entry.descriptor);
        }
    }

    tracing::info!(descriptors = declared, servers = handoff.servers.len(), "Handoff accepted");
    Some(handoff)
}

fn release_declared(count: usize) {
    for offset in 0..count {
        inherit::release(FIRST_INHERITED + offset as Descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> RouteSetup {
        Arc::new(|server: &ServerConfig, table: &RouteTable| {
            let name = server.name.clone();
            table.handle("/", move |_: &crate::http::Request| {
                crate::http::Response::text(axum::http::StatusCode::OK, name.clone())
            })
        })
    }

    fn config(servers: &[(&str, &str)]) -> GraceConfig {
        GraceConfig {
            servers: servers
                .iter()
                .map(|(name, address)| ServerConfig {
                    name: name.to_string(),
                    addresses: vec![address.to_string()],
                    ..ServerConfig::default()
                })
                .collect(),
            ..GraceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_servers_tolerates_partial_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().to_string();
        let config = config(&[("api", "127.0.0.1:0"), ("admin", &busy)]);
        let registry = ServerRegistry::new(Duration::from_secs(1));

        let running = start_servers(&registry, &config, None, &setup()).await.unwrap();
        assert_eq!(running, 1);
        assert_eq!(registry.get("api").unwrap().state(), ServerState::Running);
        assert_eq!(registry.get("admin").unwrap().state(), ServerState::Stopped);
        registry.get("api").unwrap().drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_servers_fails_when_none_runs() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().to_string();
        let config = config(&[("api", &busy)]);
        let registry = ServerRegistry::new(Duration::from_secs(1));

        let err = start_servers(&registry, &config, None, &setup()).await.unwrap_err();
        assert!(matches!(err, ServerError::BindFailed { .. }));
    }

    #[tokio::test]
    async fn test_route_setup_failure_is_reported() {
        let config = config(&[("api", "127.0.0.1:0")]);
        let registry = ServerRegistry::new(Duration::from_secs(1));
        let broken: RouteSetup =
            Arc::new(|_: &ServerConfig, table: &RouteTable| table.handle("/:", |_: &crate::http::Request| {
                crate::http::Response::default()
            }));

        let err = start_servers(&registry, &config, None, &broken).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidPattern { .. }));
    }
}
