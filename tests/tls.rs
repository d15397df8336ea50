//! HTTPS listeners, served directly and handed to a successor.

mod common;

use std::time::Duration;

use common::{
    build_server, client, free_addresses, https_client, https_url, local_addrs, server_config, text, tls_fixture, url,
    StatusCode,
};
use gracehttp::config::ServerConfig;
use gracehttp::http::{Request, Response, RouteTable};
use gracehttp::ServerState;

fn secure_config(name: &str, plain: Vec<String>, https: Vec<String>, dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        https_addresses: https,
        tls: Some(tls_fixture(dir)),
        ..server_config(name, plain)
    }
}

#[tokio::test]
async fn test_https_listener_serves_routes() {
    let dir = tempfile::tempdir().unwrap();
    let config = secure_config(
        "secure",
        vec!["127.0.0.1:0".to_string()],
        vec!["127.0.0.1:0".to_string()],
        dir.path(),
    );
    let server = build_server(config, Duration::from_secs(1), |table: &RouteTable| {
        table.handle("/scheme", |req: &Request| {
            Response::text(StatusCode::OK, if req.is_secure() { "https" } else { "http" })
        })
    });
    server.start(None).await.unwrap();

    let records = server.listeners().records();
    assert_eq!(records.len(), 2);
    assert!(!records[0].is_secure());
    assert!(records[1].is_secure());
    let addrs = local_addrs(&server);

    let res = client().get(url(addrs[0], "/scheme")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "http");

    let res = https_client(addrs[1]).get(https_url(addrs[1], "/scheme")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.version(), reqwest::Version::HTTP_11);
    assert_eq!(res.text().await.unwrap(), "https");

    // Plain HTTP on the TLS port never reaches a handler.
    assert!(client().get(url(addrs[1], "/scheme")).send().await.is_err());

    server.drain().await.unwrap();
}

#[tokio::test]
async fn test_https_without_certificate_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = secure_config(
        "secure",
        vec!["127.0.0.1:0".to_string()],
        vec!["127.0.0.1:0".to_string()],
        dir.path(),
    );
    if let Some(tls) = config.tls.as_mut() {
        tls.key_path = dir.path().join("missing.pem");
    }
    let server = build_server(config, Duration::from_secs(1), |table: &RouteTable| {
        table.handle("/", text("plain"))
    });
    server.start(None).await.unwrap();

    let records = server.listeners().records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_secure());
    server.drain().await.unwrap();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_successor_takes_over_https_listener() {
    use std::sync::Arc;

    use gracehttp::lifecycle::Handoff;

    let dir = tempfile::tempdir().unwrap();
    let https = free_addresses(1);
    let grace = Duration::from_secs(5);
    let old = build_server(
        secure_config("web", Vec::new(), https.clone(), dir.path()),
        grace,
        |table: &RouteTable| table.handle("/", text("old")),
    );
    old.start(None).await.unwrap();
    let addr = local_addrs(&old)[0];
    let res = https_client(addr).get(https_url(addr, "/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "old");

    let mut handoff = Handoff::default();
    for source in old.handoff_sources() {
        assert!(source.secure);
        // SAFETY: dup of an open listening socket.
        let duplicate = unsafe { libc::dup(source.descriptor) };
        assert!(duplicate >= 0);
        handoff.server_mut("web").push(source.secure, &source.address, duplicate);
    }
    let handoff = Handoff::decode(&handoff.encode().unwrap()).unwrap();
    assert_eq!(handoff.server("web").map(|fdmap| fdmap.https.is_empty()), Some(false));

    let new = build_server(
        secure_config("web", Vec::new(), https.clone(), dir.path()),
        grace,
        |table: &RouteTable| table.handle("/", text("new")),
    );
    new.start(handoff.server("web")).await.unwrap();
    let records = new.listeners().records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_secure());
    assert!(records[0].is_inherited());
    assert_eq!(local_addrs(&new), vec![addr]);

    let draining = {
        let old = Arc::clone(&old);
        tokio::spawn(async move { old.drain().await })
    };
    draining.await.unwrap().unwrap();
    assert_eq!(old.state(), ServerState::Stopped);

    let res = https_client(addr).get(https_url(addr, "/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "new");
    new.drain().await.unwrap();
}
