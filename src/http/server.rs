//! Named server instance: listeners, route table and lifecycle.
//!
//! # Responsibilities
//! - Own the listeners of one logical server and its route table
//! - Start fresh or from descriptors inherited through an FdMap
//! - Serve connections over HTTP/1.1 (optionally TLS) with the middleware stack
//! - Reload handlers in place, drain on shutdown
//!
//! # Design Decisions
//! - The live table sits behind `ArcSwap`: requests load it without locking,
//!   a reload swaps in a fully built replacement
//! - The configuration sits behind `ArcSwap` too; each accepted connection
//!   builds its middleware stack from the configuration current at accept
//! - Draining never closes a connection that has not delivered its first
//!   request yet, unless it stays silent past `FIRST_REQUEST_WINDOW`
//! - A listener that fails to bind is logged and skipped; the server starts
//!   as long as one listener is up

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::any,
    Extension, Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::http::handler::{Handler, Hook, MethodTable};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::table::RouteTable;
use crate::lifecycle::fdmap::{FdMap, InheritedEntry};
use crate::lifecycle::state::{ServerState, StateMachine};
use crate::net::inherit;
use crate::net::listener::{Accepted, ConnectionSignals, HandoffSource, ListenerRecord, ListenerSet};
use crate::net::tls::load_tls_acceptor;
use crate::observability::metrics;
use crate::routing::{HookEvent, RouteMethod};

/// Largest request body buffered for a handler.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// How long a draining server still waits for the first request of a
/// connection it accepted but has not read from yet.
const FIRST_REQUEST_WINDOW: Duration = Duration::from_secs(5);

/// Rebuilds a server's routes into a fresh table during hot reload.
pub type Reloader = Arc<dyn Fn(&RouteTable) -> Result<(), ServerError> + Send + Sync>;

/// Transport facts a handler cannot read off the request itself.
#[derive(Debug, Clone, Copy)]
struct Transport {
    secure: bool,
}

pub struct Server {
    name: String,
    config: ArcSwap<ServerConfig>,
    table: ArcSwap<RouteTable>,
    reloader: RwLock<Option<Reloader>>,
    state: StateMachine,
    listeners: ListenerSet,
}

impl Server {
    pub fn new(config: ServerConfig, grace: Duration) -> Self {
        Self {
            name: config.name.clone(),
            table: ArcSwap::from_pointee(RouteTable::new(config.route_cache_capacity)),
            listeners: ListenerSet::new(config.max_connections, grace),
            reloader: RwLock::new(None),
            state: StateMachine::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration currently in effect.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.load_full()
    }

    /// Drain grace period currently in effect.
    pub fn grace(&self) -> Duration {
        self.listeners.grace()
    }

    pub fn state(&self) -> ServerState {
        self.state.current()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// The live route table.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn register(
        &self,
        method: RouteMethod,
        domain: &str,
        pattern: &str,
        priority: Option<i32>,
        handler: impl Handler,
    ) -> Result<(), ServerError> {
        self.table.load().register(method, domain, pattern, priority, Arc::new(handler))
    }

    pub fn register_hook(
        &self,
        event: HookEvent,
        domain: &str,
        pattern: &str,
        priority: Option<i32>,
        hook: impl Hook,
    ) -> Result<(), ServerError> {
        self.table.load().register_hook(event, domain, pattern, priority, Arc::new(hook))
    }

    pub fn handle(&self, route: &str, handler: impl Handler) -> Result<(), ServerError> {
        self.table.load().handle(route, handler)
    }

    pub fn hook(&self, event: HookEvent, route: &str, hook: impl Hook) -> Result<(), ServerError> {
        self.table.load().hook(event, route, hook)
    }

    pub fn bind_methods(&self, route: &str, table: &MethodTable) -> Result<(), ServerError> {
        self.table.load().bind_methods(route, table)
    }

    pub fn set_status_handler(&self, status: StatusCode, handler: impl Handler) {
        self.table.load().set_status_handler(status, handler)
    }

    /// Install the reloader and use it to populate the live table.
    pub fn set_reloader(
        &self,
        reloader: impl Fn(&RouteTable) -> Result<(), ServerError> + Send + Sync + 'static,
    ) -> Result<(), ServerError> {
        let reloader: Reloader = Arc::new(reloader);
        reloader(&self.table.load())?;
        *self.reloader.write().unwrap_or_else(PoisonError::into_inner) = Some(reloader);
        Ok(())
    }

    pub fn has_reloader(&self) -> bool {
        self.reloader.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Rebuild the route table with the reloader and swap it in. The old
    /// table stays live when the reloader fails.
    pub fn reload(&self) -> Result<(), ServerError> {
        self.rebuild(None)
    }

    /// Adopt `config` and rebuild the route table under it. Cache capacity
    /// and request timeout apply to the new table and to connections
    /// accepted from now on; `grace` bounds the next drain. Listener
    /// settings cannot change here. On failure nothing is changed.
    pub fn reconfigure(&self, config: ServerConfig, grace: Duration) -> Result<(), ServerError> {
        if config.name != self.name || !self.config().same_listeners(&config) {
            return Err(ServerError::ListenersChanged(self.name.clone()));
        }
        self.rebuild(Some(config))?;
        self.listeners.set_grace(grace);
        Ok(())
    }

    fn rebuild(&self, next: Option<ServerConfig>) -> Result<(), ServerError> {
        let reloader = self
            .reloader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ServerError::NoReloader(self.name.clone()))?;

        self.state.transition(ServerState::Reloading)?;
        // The reloader reads the configuration it builds for.
        let previous = next.map(|next| self.config.swap(Arc::new(next)));
        let table = RouteTable::new(self.config().route_cache_capacity);
        let result = reloader(&table);
        match &result {
            Ok(()) => {
                tracing::info!(
                    server = %self.name,
                    routes = table.routes().len(),
                    hooks = table.hooks().len(),
                    cache_capacity = table.routes().cache().capacity(),
                    "Route table reloaded"
                );
                self.table.store(Arc::new(table));
            }
            Err(e) => {
                if let Some(previous) = previous {
                    self.config.store(previous);
                }
                tracing::error!(server = %self.name, error = %e, "Reload failed, keeping current routes");
            }
        }
        self.state.transition(ServerState::Running)?;
        result
    }

    /// Bind every configured address (attaching to inherited descriptors
    /// where the FdMap has them) and start serving.
    pub async fn start(self: &Arc<Self>, inherited: Option<&FdMap>) -> Result<(), ServerError> {
        self.state.transition(ServerState::Starting)?;
        match self.bind_all(inherited).await {
            Ok(count) => {
                self.state.transition(ServerState::Running)?;
                tracing::info!(server = %self.name, listeners = count, "Server running");
                Ok(())
            }
            Err(e) => {
                self.state.transition(ServerState::Stopped)?;
                tracing::error!(server = %self.name, error = %e, "Server failed to start");
                Err(e)
            }
        }
    }

    /// Bind the configured addresses afresh while the server keeps its
    /// state. Used when a hard restart must be rolled back.
    pub async fn rebind(self: &Arc<Self>) -> Result<(), ServerError> {
        let count = self.bind_all(None).await?;
        tracing::info!(server = %self.name, listeners = count, "Listeners rebound");
        Ok(())
    }

    /// Stop accepting and close the listening sockets; in-flight requests
    /// continue. The server state is left alone.
    pub async fn release(&self) {
        self.listeners.release().await;
        tracing::info!(server = %self.name, "Listeners released");
    }

    /// Stop accepting, let in-flight requests finish within the grace
    /// period, then stop.
    pub async fn drain(&self) -> Result<(), ServerError> {
        self.state.transition(ServerState::Draining)?;
        tracing::info!(server = %self.name, grace_secs = self.grace().as_secs(), "Server draining");
        self.listeners.drain();
        // A successor holds its own descriptor, so closing ours only
        // refuses new clients when nobody else is listening.
        self.listeners.close();
        self.listeners.wait_stopped().await;
        self.state.transition(ServerState::Stopped)?;
        tracing::info!(server = %self.name, "Server stopped");
        Ok(())
    }

    pub fn handoff_sources(&self) -> Vec<HandoffSource> {
        self.listeners.handoff_sources()
    }

    async fn bind_all(self: &Arc<Self>, inherited: Option<&FdMap>) -> Result<usize, ServerError> {
        let mut inherited = inherited_by_address(&self.name, inherited);
        let config = self.config();

        let tls = match (&config.tls, config.https_addresses.is_empty()) {
            (Some(tls), false) => match load_tls_acceptor(&tls.cert_path, &tls.key_path).await {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    tracing::error!(server = %self.name, error = %e, "HTTPS listeners disabled");
                    None
                }
            },
            _ => None,
        };

        let configured = config
            .addresses
            .iter()
            .map(|a| (a, false))
            .chain(config.https_addresses.iter().map(|a| (a, true)));

        let mut records = Vec::new();
        let mut last_error = None;
        for (address, secure) in configured {
            let descriptor = inherited.remove(address.as_str()).map(|entry| entry.descriptor);
            if secure && tls.is_none() {
                if let Some(descriptor) = descriptor {
                    inherit::release(descriptor);
                }
                last_error = Some(ServerError::bind_failed(
                    address,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no usable TLS certificate"),
                ));
                continue;
            }
            match self.listeners.bind(address, secure, descriptor) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::error!(server = %self.name, address = %address, error = %e, "Listener failed");
                    last_error = Some(e);
                }
            }
        }

        for (address, entry) in inherited {
            tracing::info!(
                server = %self.name,
                address = %address,
                descriptor = entry.descriptor,
                "Closing inherited listener that is no longer configured"
            );
            inherit::release(entry.descriptor);
        }

        if records.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                ServerError::bind_failed(
                    &self.name,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no listen addresses"),
                )
            }));
        }

        let count = records.len();
        for record in &records {
            self.spawn_accept_loop(Arc::clone(record), tls.clone());
        }
        for record in &records {
            record.started().await;
        }
        Ok(count)
    }

    fn spawn_accept_loop(self: &Arc<Self>, record: Arc<ListenerRecord>, tls: Option<TlsAcceptor>) {
        let server = Arc::clone(self);
        tokio::spawn(record.accept_loop(move |accepted| {
            serve_connection(accepted, server.app(), tls.clone())
        }));
    }

    /// Middleware stack around the dispatcher, built from the current
    /// configuration.
    #[allow(deprecated)]
    pub fn app(self: &Arc<Self>) -> Router {
        let timeout = Duration::from_secs(self.config().request_timeout_secs);
        Router::new()
            .route("/", any(dispatch))
            .route("/{*path}", any(dispatch))
            .with_state(Arc::clone(self))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TimeoutLayer::new(timeout))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// This server's inherited entries keyed by address; malformed entries are
/// logged as bind failures and dropped.
fn inherited_by_address(server: &str, fdmap: Option<&FdMap>) -> HashMap<String, InheritedEntry> {
    let Some(fdmap) = fdmap else {
        return HashMap::new();
    };
    fdmap
        .entries()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some((entry.address.clone(), entry)),
            Err(reason) => {
                let err = ServerError::bind_failed(
                    server,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, reason),
                );
                tracing::error!(server = %server, error = %err, "Malformed inherited listener");
                None
            }
        })
        .collect()
}

/// Main request handler: runs one exchange through the live route table.
async fn dispatch(
    State(server): State<Arc<Server>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(transport): Extension<Transport>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(server = %server.name(), error = %e, "Request body rejected");
            metrics::record_request(server.name(), StatusCode::PAYLOAD_TOO_LARGE.as_u16(), start);
            return Response::text(StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let mut req = Request::from_parts(parts, body, peer, transport.secure);
    let table = server.routes();
    let mut res = table.serve(&mut req);
    let output = res.clone().into_response();
    table.run_hooks(HookEvent::AfterOutput, &mut req, &mut res);

    let status = output.status();
    metrics::record_request(server.name(), status.as_u16(), start);
    tracing::debug!(
        server = %server.name(),
        request_id = %req.id(),
        method = %req.method(),
        host = %req.host(),
        path = %req.path(),
        status = status.as_u16(),
        "Request served"
    );

    if !table.hooks().is_empty() {
        tokio::spawn(async move { table.close(req, res) });
    }
    output
}

async fn serve_connection(accepted: Accepted, app: Router, tls: Option<TlsAcceptor>) {
    let Accepted {
        stream,
        peer,
        secure,
        guard,
        signals,
    } = accepted;

    let first = Arc::new(FirstRequest::default());
    let service = {
        let first = Arc::clone(&first);
        TowerToHyperService::new(app.map_request(move |mut req: axum::http::Request<Incoming>| {
            first.mark();
            req.extensions_mut().insert(ConnectInfo(peer));
            req.extensions_mut().insert(Transport { secure });
            req
        }))
    };
    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());

    if secure {
        let Some(acceptor) = tls else {
            return;
        };
        let stream = tokio::select! {
            handshake = acceptor.accept(stream) => match handshake {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(peer_addr = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            },
            _ = signals.aborted() => return,
        };
        drive(builder.serve_connection(TokioIo::new(stream), service), &signals, &first, peer).await;
    } else {
        drive(builder.serve_connection(TokioIo::new(stream), service), &signals, &first, peer).await;
    }

    drop(guard);
}

/// Set once hyper has parsed the first request head of a connection.
#[derive(Debug, Default)]
struct FirstRequest {
    seen: AtomicBool,
    arrived: Notify,
}

impl FirstRequest {
    fn mark(&self) {
        if !self.seen.swap(true, Ordering::AcqRel) {
            // notify_one keeps a permit if nobody waits yet.
            self.arrived.notify_one();
        }
    }

    fn seen(&self) -> bool {
        self.seen.load(Ordering::Acquire)
    }
}

/// Run a connection to completion; ask it to finish its current exchange
/// when the listener drains and drop it when the grace period is over.
///
/// A graceful shutdown closes an HTTP/1 connection that is between
/// requests at once. A connection that has not sent its first request is
/// therefore only asked to shut down after that request arrived, or after
/// `FIRST_REQUEST_WINDOW` of silence.
async fn drive<I, S, B>(
    conn: http1::Connection<I, S>,
    signals: &ConnectionSignals,
    first: &FirstRequest,
    peer: SocketAddr,
) where
    S: hyper::service::HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    I: hyper::rt::Read + hyper::rt::Write + Unpin,
    B: hyper::body::Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    tokio::pin!(conn);
    let silence = tokio::time::sleep(FIRST_REQUEST_WINDOW);
    tokio::pin!(silence);
    let mut draining = false;
    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(peer_addr = %peer, error = %e, "Connection closed with error");
                }
                return;
            }
            _ = signals.draining(), if !draining => {
                draining = true;
                if first.seen() {
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                } else {
                    silence.as_mut().reset(tokio::time::Instant::now() + FIRST_REQUEST_WINDOW);
                }
            }
            _ = first.arrived.notified(), if draining && !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = &mut silence, if draining && !closing => {
                tracing::debug!(peer_addr = %peer, "No request before drain window ended");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = signals.aborted() => {
                tracing::debug!(peer_addr = %peer, "Connection aborted after grace period");
                return;
            }
        }
    }
}
