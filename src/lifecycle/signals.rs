//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGUSR2, SIGHUP, SIGTERM, SIGINT)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGUSR2 restarts with a new process, SIGHUP reloads handlers in place
//! - Only Ctrl+C is available off unix, and it means shutdown

/// What a received signal asks the process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Restart,
    Reload,
    Shutdown,
}

impl ProcessSignal {
    /// The OS signal number that requests this action.
    #[cfg(unix)]
    pub fn raw(self) -> libc::c_int {
        match self {
            ProcessSignal::Restart => libc::SIGUSR2,
            ProcessSignal::Reload => libc::SIGHUP,
            ProcessSignal::Shutdown => libc::SIGTERM,
        }
    }
}

#[cfg(unix)]
pub struct Signals {
    restart: tokio::signal::unix::Signal,
    reload: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            restart: signal(SignalKind::user_defined2())?,
            reload: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> ProcessSignal {
        let signal = tokio::select! {
            _ = self.restart.recv() => ProcessSignal::Restart,
            _ = self.reload.recv() => ProcessSignal::Reload,
            _ = self.terminate.recv() => ProcessSignal::Shutdown,
            _ = self.interrupt.recv() => ProcessSignal::Shutdown,
        };
        tracing::info!(signal = ?signal, "Signal received");
        signal
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> ProcessSignal {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
        ProcessSignal::Shutdown
    }
}
