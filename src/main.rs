//! gracehttp server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                       WORKER                          │
//!                    │                                                       │
//!   Client Request   │  ┌──────────┐   ┌─────────┐   ┌──────────────────┐    │
//!   ─────────────────┼─▶│   net    │──▶│  http   │──▶│  routing         │    │
//!                    │  │ listener │   │ server  │   │ hooks + routes   │    │
//!                    │  └──────────┘   └─────────┘   └────────┬─────────┘    │
//!                    │                                         ▼              │
//!   Client Response  │                 ┌─────────┐   ┌──────────────────┐    │
//!   ◀────────────────┼─────────────────│response │◀──│  handler         │    │
//!                    │                 └─────────┘   └──────────────────┘    │
//!                    │                                                       │
//!                    │  ┌──────────────────────────────────────────────────┐ │
//!                    │  │ lifecycle: signals → coordinator → successor     │ │
//!                    │  │            (listening sockets handed over)       │ │
//!                    │  └──────────────────────────────────────────────────┘ │
//!                    └──────────────────────────────────────────────────────┘
//! ```
//!
//! With `process.supervise = true` the first process stays on top as a
//! coordinator that owns no sockets and forwards signals to its workers.

use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use clap::Parser;
use serde_json::json;

use gracehttp::cli::Cli;
use gracehttp::config::{load_config, GraceConfig, ServerConfig};
use gracehttp::http::{Request, Response, RouteTable};
use gracehttp::lifecycle::{supervisor, ProcessRole};
use gracehttp::observability::logging::init_logging;
use gracehttp::routing::HookEvent;
use gracehttp::runtime::run_worker;
use gracehttp::ServerError;

/// Path of the built-in status endpoint.
const STATUS_PATH: &str = "/_gracehttp/status";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let found = cli.config.exists();
    let config = if found {
        load_config(&cli.config)?
    } else {
        GraceConfig::default()
    };
    init_logging(&config.observability);
    if !found {
        tracing::warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match ProcessRole::detect(&cli, &config.process) {
        ProcessRole::Coordinator => {
            tracing::info!(pid = std::process::id(), "gracehttp coordinator starting");
            let code = supervisor::supervise(&cli).await?;
            std::process::exit(code);
        }
        ProcessRole::Worker { top } => {
            tracing::info!(
                pid = std::process::id(),
                top = ?top,
                successor = cli.is_successor(),
                servers = config.servers.len(),
                "gracehttp worker starting"
            );
            run_worker(cli, config, Arc::new(install_routes)).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Built-in routes of the stock binary.
fn install_routes(server: &ServerConfig, table: &RouteTable) -> Result<(), ServerError> {
    let name = server.name.clone();
    table.handle("/", move |_: &Request| {
        Response::text(
            StatusCode::OK,
            format!("gracehttp server `{}` (pid {})\n", name, std::process::id()),
        )
    })?;

    let name = server.name.clone();
    let addresses = server.addresses.clone();
    let https_addresses = server.https_addresses.clone();
    table.handle(&format!("GET:{STATUS_PATH}"), move |_: &Request| {
        Response::json(
            StatusCode::OK,
            &json!({
                "server": name,
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "addresses": addresses,
                "https_addresses": https_addresses,
            }),
        )
    })?;

    table.hook(HookEvent::BeforeServe, "/*", |_: &mut Request, res: &mut Response| {
        res.headers_mut()
            .insert("x-served-by", HeaderValue::from(std::process::id()));
    })?;

    table.set_status_handler(StatusCode::NOT_FOUND, |req: &Request| {
        Response::json(
            StatusCode::NOT_FOUND,
            &json!({ "error": "not found", "path": req.path(), "request_id": req.id() }),
        )
    });
    Ok(())
}
