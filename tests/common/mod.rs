//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gracehttp::config::{ServerConfig, TlsConfig};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use gracehttp::http::{Request, Response, RouteTable, Server};
use gracehttp::ServerError;

pub use axum::http::StatusCode;

/// Loopback addresses that were free a moment ago.
pub fn free_addresses(count: usize) -> Vec<String> {
    let probes: Vec<_> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    probes
        .iter()
        .map(|probe| probe.local_addr().unwrap().to_string())
        .collect()
}

pub fn server_config(name: &str, addresses: Vec<String>) -> ServerConfig {
    ServerConfig {
        name: name.into(),
        addresses,
        ..ServerConfig::default()
    }
}

/// Build a server with routes installed by `routes` (also its reloader).
pub fn build_server<F>(config: ServerConfig, grace: Duration, routes: F) -> Arc<Server>
where
    F: Fn(&RouteTable) -> Result<(), ServerError> + Send + Sync + 'static,
{
    let server = Arc::new(Server::new(config, grace));
    server.set_reloader(routes).unwrap();
    server
}

/// Start a server on ephemeral loopback ports.
pub async fn start_server<F>(listeners: usize, routes: F) -> Arc<Server>
where
    F: Fn(&RouteTable) -> Result<(), ServerError> + Send + Sync + 'static,
{
    let config = server_config("test", vec!["127.0.0.1:0".to_string(); listeners]);
    let server = build_server(config, Duration::from_secs(5), routes);
    server.start(None).await.unwrap();
    server
}

/// Bound addresses, in configuration order.
pub fn local_addrs(server: &Server) -> Vec<SocketAddr> {
    server
        .listeners()
        .records()
        .iter()
        .map(|record| record.local_addr())
        .collect()
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

/// Client without pooling so every request opens its own connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

pub fn text(body: &'static str) -> impl Fn(&Request) -> Response + Send + Sync + 'static {
    move |_: &Request| Response::text(StatusCode::OK, body)
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition still false after 5s");
}

/// Self-signed `localhost` certificate written into `dir`.
pub fn tls_fixture(dir: &Path) -> TlsConfig {
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    TlsConfig { cert_path, key_path }
}

pub fn https_url(addr: SocketAddr, path: &str) -> String {
    format!("https://localhost:{}{path}", addr.port())
}

/// Client for the self-signed fixture, with `localhost` pinned to `addr`.
pub fn https_client(addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .resolve("localhost", addr)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
