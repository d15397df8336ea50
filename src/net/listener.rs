//! Listening sockets owned by one server instance.
//!
//! # Responsibilities
//! - Bind configured addresses, or attach to sockets inherited from a predecessor
//! - Accept incoming TCP connections, bounded by `max_connections`
//! - Drain: stop accepting, let live connections finish within a grace period
//! - Report per-listener and aggregate state
//!
//! # Listener States
//! ```text
//! Starting → Running → Draining → Stopped
//! ```
//!
//! # Design Decisions
//! - The bound `std` socket stays owned by the record so its descriptor can be
//!   handed to a successor at any time; the accept loop works on a clone
//! - Draining cancels only this listener's accept loop; connections receive a
//!   graceful-shutdown request and are aborted only once the grace period ends

use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::error::ServerError;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::inherit::{Descriptor, InheritableListener};
use crate::observability::metrics;

/// Back-off after an accept error such as descriptor exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// One bound address.
#[derive(Debug)]
pub struct ListenerRecord {
    address: String,
    local_addr: SocketAddr,
    secure: bool,
    inherited: bool,
    socket: Mutex<Option<StdTcpListener>>,
    state: watch::Sender<ListenerState>,
    abort: watch::Sender<bool>,
    released: watch::Sender<bool>,
    connections: ConnectionTracker,
    connection_limit: Arc<Semaphore>,
    grace: Arc<AtomicU64>,
    counted: AtomicBool,
}

impl ListenerRecord {
    fn new(
        address: &str,
        socket: StdTcpListener,
        secure: bool,
        inherited: bool,
        max_connections: usize,
        grace: Arc<AtomicU64>,
    ) -> Result<Self, ServerError> {
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::bind_failed(address, e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ServerError::bind_failed(address, e))?;
        Ok(Self {
            address: address.to_string(),
            local_addr,
            secure,
            inherited,
            socket: Mutex::new(Some(socket)),
            state: watch::channel(ListenerState::Starting).0,
            abort: watch::channel(false).0,
            released: watch::channel(true).0,
            connections: ConnectionTracker::new(),
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            grace,
            counted: AtomicBool::new(false),
        })
    }

    /// Address as configured (the FdMap key).
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// True when the socket came from a predecessor rather than a fresh bind.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Descriptor of the bound socket, `None` once closed.
    pub fn descriptor(&self) -> Option<Descriptor> {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        socket.as_ref().and_then(|s| s.descriptor().ok())
    }

    /// Stop accepting. Returns false if the listener was not accepting.
    pub fn drain(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            ListenerState::Starting | ListenerState::Running => {
                *state = ListenerState::Draining;
                true
            }
            _ => false,
        })
    }

    /// Release the socket. Connections queued in the kernel backlog are
    /// only lost if no other process holds the same socket.
    pub fn close(&self) {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if socket.take().is_some() {
            tracing::debug!(address = %self.address, "Listener socket closed");
        }
    }

    /// Resolves once the accept loop has taken over (or given up on) the socket.
    pub async fn started(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != ListenerState::Starting).await;
    }

    /// Resolves once the listener reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ListenerState::Stopped).await;
    }

    /// Resolves once the accept loop no longer holds a clone of the socket.
    pub async fn released(&self) {
        let mut rx = self.released.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }

    fn signals(&self) -> ConnectionSignals {
        ConnectionSignals {
            state: self.state.subscribe(),
            abort: self.abort.subscribe(),
        }
    }

    fn mark_stopped(&self) {
        let previous = self.state.send_replace(ListenerState::Stopped);
        if self.counted.swap(false, Ordering::SeqCst) {
            metrics::listener_stopped();
        }
        tracing::debug!(address = %self.address, from = ?previous, "Listener state changed");
    }

    fn clone_socket(&self) -> std::io::Result<TcpListener> {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = socket
            .as_ref()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "listener closed"))?
            .try_clone()?;
        TcpListener::from_std(socket)
    }

    /// Drain grace period currently configured for this listener's set.
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace.load(Ordering::Relaxed))
    }

    /// Accept connections until the listener starts draining, then wait for
    /// live connections (bounded by the grace period in effect at that
    /// moment) and mark the listener Stopped.
    pub async fn accept_loop<F, Fut>(self: Arc<Self>, serve: F)
    where
        F: Fn(Accepted) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = match self.clone_socket() {
            Ok(listener) => {
                self.released.send_replace(false);
                listener
            }
            Err(e) => {
                tracing::error!(address = %self.address, error = %e, "Listener unusable");
                self.mark_stopped();
                return;
            }
        };

        let mut state = self.state.subscribe();
        let running = self.state.send_if_modified(|s| {
            if *s == ListenerState::Starting {
                *s = ListenerState::Running;
                true
            } else {
                false
            }
        });
        if running {
            self.counted.store(true, Ordering::SeqCst);
            metrics::listener_started();
            tracing::info!(
                address = %self.address,
                local_addr = %self.local_addr,
                secure = self.secure,
                inherited = self.inherited,
                "Listener running"
            );
        }

        loop {
            let permit = tokio::select! {
                _ = draining(&mut state) => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;
                _ = draining(&mut state) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let guard = self.connections.track(Some(permit));
                        tracing::debug!(
                            address = %self.address,
                            peer_addr = %peer,
                            connection_id = %guard.id(),
                            available_permits = self.connection_limit.available_permits(),
                            "Connection accepted"
                        );
                        tokio::spawn(serve(Accepted {
                            stream,
                            peer,
                            secure: self.secure,
                            guard,
                            signals: self.signals(),
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(address = %self.address, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        drop(listener);
        self.released.send_replace(true);

        let active = self.connections.active_count();
        let grace = self.grace();
        tracing::info!(address = %self.address, active_connections = active, "Listener draining");
        if !self.connections.wait_idle(grace).await {
            tracing::warn!(
                address = %self.address,
                active_connections = self.connections.active_count(),
                grace_secs = grace.as_secs_f64(),
                "Grace period elapsed, aborting remaining connections"
            );
            self.abort.send_replace(true);
        }

        self.mark_stopped();
        tracing::info!(address = %self.address, "Listener stopped");
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn draining(state: &mut watch::Receiver<ListenerState>) {
    let _ = state
        .wait_for(|s| matches!(s, ListenerState::Draining | ListenerState::Stopped))
        .await;
}

/// An accepted connection, handed to the HTTP layer.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub secure: bool,
    pub guard: ConnectionGuard,
    pub signals: ConnectionSignals,
}

/// Lets a connection task follow its listener's shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionSignals {
    state: watch::Receiver<ListenerState>,
    abort: watch::Receiver<bool>,
}

impl ConnectionSignals {
    /// Resolves when the listener begins draining.
    pub async fn draining(&self) {
        draining(&mut self.state.clone()).await
    }

    /// Resolves when the grace period has run out.
    pub async fn aborted(&self) {
        if self.abort.clone().wait_for(|aborted| *aborted).await.is_err() {
            // Listener gone: nothing will ever abort this connection.
            std::future::pending::<()>().await;
        }
    }
}

/// A listener that is handed over: configured address, secure flag, descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSource {
    pub address: String,
    pub secure: bool,
    pub descriptor: Descriptor,
}

/// Every listener of one server instance.
#[derive(Debug)]
pub struct ListenerSet {
    max_connections: usize,
    grace: Arc<AtomicU64>,
    records: RwLock<Vec<Arc<ListenerRecord>>>,
}

impl ListenerSet {
    pub fn new(max_connections: usize, grace: Duration) -> Self {
        Self {
            max_connections: max_connections.max(1),
            grace: Arc::new(AtomicU64::new(millis(grace))),
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace.load(Ordering::Relaxed))
    }

    /// Change the drain grace period. Applies to every listener of the set,
    /// including those already accepting, from their next drain on.
    pub fn set_grace(&self, grace: Duration) {
        self.grace.store(millis(grace), Ordering::Relaxed);
    }

    /// Bind `address`, or attach to `inherited` when given.
    ///
    /// An inherited descriptor is the predecessor's socket itself, already
    /// bound and listening; attaching never opens a new socket.
    pub fn bind(
        &self,
        address: &str,
        secure: bool,
        inherited: Option<Descriptor>,
    ) -> Result<Arc<ListenerRecord>, ServerError> {
        let socket = match inherited {
            Some(descriptor) => {
                let socket = StdTcpListener::attach(descriptor)
                    .map_err(|e| ServerError::bind_failed(address, e))?;
                tracing::info!(address = %address, descriptor, secure, "Attached inherited listener");
                socket
            }
            None => {
                let socket = StdTcpListener::bind(address)
                    .map_err(|e| ServerError::bind_failed(address, e))?;
                tracing::info!(address = %address, secure, "Listener bound");
                socket
            }
        };

        let record = Arc::new(ListenerRecord::new(
            address,
            socket,
            secure,
            inherited.is_some(),
            self.max_connections,
            Arc::clone(&self.grace),
        )?);
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&record));
        Ok(record)
    }

    pub fn records(&self) -> Vec<Arc<ListenerRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// `Running` if any listener is running, otherwise `Stopped`.
    pub fn status(&self) -> ListenerState {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        if records.iter().any(|r| r.state() == ListenerState::Running) {
            ListenerState::Running
        } else {
            ListenerState::Stopped
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Put every listener into Draining.
    pub fn drain(&self) {
        for record in self.records() {
            record.drain();
        }
    }

    /// Close every socket. Only safe once no successor needs them.
    pub fn close(&self) {
        for record in self.records() {
            record.close();
        }
    }

    /// Stop accepting and close every socket, returning once no accept loop
    /// holds one. In-flight connections keep running.
    pub async fn release(&self) {
        let records = self.records();
        for record in &records {
            record.drain();
            record.close();
        }
        for record in &records {
            record.released().await;
        }
    }

    /// Wait for every listener to reach Stopped, then forget them.
    pub async fn wait_stopped(&self) {
        for record in self.records() {
            record.stopped().await;
        }
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.state() != ListenerState::Stopped);
    }

    /// Sockets that can be passed to a successor, in bind order.
    pub fn handoff_sources(&self) -> Vec<HandoffSource> {
        self.records()
            .iter()
            .filter(|r| matches!(r.state(), ListenerState::Starting | ListenerState::Running))
            .filter_map(|r| {
                r.descriptor().map(|descriptor| HandoffSource {
                    address: r.address.clone(),
                    secure: r.secure,
                    descriptor,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_bind_failed_is_per_address() {
        let set = ListenerSet::new(16, Duration::from_secs(1));
        let first = set.bind("127.0.0.1:0", false, None).unwrap();
        let taken = first.local_addr().to_string();

        let err = set.bind(&taken, false, None).unwrap_err();
        assert!(matches!(err, ServerError::BindFailed { .. }));
        assert!(set.bind("not an address", false, None).is_err());
        assert_eq!(set.records().len(), 1);
    }

    #[tokio::test]
    async fn test_status_and_drain() {
        let set = ListenerSet::new(16, Duration::from_secs(1));
        let record = set.bind("127.0.0.1:0", false, None).unwrap();
        assert_eq!(set.status(), ListenerState::Stopped);

        let task = tokio::spawn(Arc::clone(&record).accept_loop(|_| async {}));
        let mut rx = record.state.subscribe();
        rx.wait_for(|s| *s == ListenerState::Running).await.unwrap();
        assert_eq!(set.status(), ListenerState::Running);
        assert_eq!(set.handoff_sources().len(), 1);

        set.drain();
        task.await.unwrap();
        assert_eq!(record.state(), ListenerState::Stopped);
        assert_eq!(set.status(), ListenerState::Stopped);
        set.wait_stopped().await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_connection() {
        let set = ListenerSet::new(16, Duration::from_secs(5));
        let record = set.bind("127.0.0.1:0", false, None).unwrap();
        let addr = record.local_addr();

        let task = tokio::spawn(Arc::clone(&record).accept_loop(|accepted| async move {
            let Accepted { mut stream, guard, .. } = accepted;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = stream.write_all(b"bye").await;
            drop(guard);
        }));

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(record.connections().active_count(), 1);

        record.drain();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(record.state(), ListenerState::Draining);

        task.await.unwrap();
        assert_eq!(record.state(), ListenerState::Stopped);
        assert_eq!(record.connections().active_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_inherited_descriptor() {
        use std::os::fd::IntoRawFd;

        let predecessor = ListenerSet::new(16, Duration::from_secs(1));
        let original = predecessor.bind("127.0.0.1:0", false, None).unwrap();
        let address = original.local_addr().to_string();
        let duplicate = original
            .socket
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .try_clone()
            .unwrap()
            .into_raw_fd();

        let successor = ListenerSet::new(16, Duration::from_secs(1));
        let record = successor.bind(&address, false, Some(duplicate)).unwrap();
        assert!(record.is_inherited());
        assert_eq!(record.local_addr(), original.local_addr());
        assert_eq!(record.descriptor(), Some(duplicate));
    }
}
