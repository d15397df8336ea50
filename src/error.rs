//! Error taxonomy shared by registration, listeners and process handoff.
//!
//! A failed route lookup is not an error: it is reported as
//! [`Resolution::NotFound`](crate::routing::Resolution::NotFound).

use thiserror::Error;

use crate::lifecycle::state::ServerState;

/// Errors produced by the serving core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Route syntax rejected at registration time.
    #[error("Invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A structurally identical binding already exists with another handler.
    #[error("Duplicate route `{0}`")]
    DuplicateRoute(String),

    /// Address unavailable or inherited descriptor unusable.
    #[error("Failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A restart or reload is already running for this process.
    #[error("Restart in progress")]
    RestartInProgress,

    /// Listening sockets cannot be passed to a successor on this platform.
    #[error("Descriptor inheritance is not supported on this platform")]
    DescriptorInheritanceUnsupported,

    /// Lifecycle state machine refused a transition.
    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ServerState, to: ServerState },

    /// The successor process could not be started or never confirmed readiness.
    #[error("Successor failed: {0}")]
    Successor(String),

    /// Certificate or key could not be loaded.
    #[error("TLS error: {0}")]
    Tls(std::io::Error),

    /// Hot reload requested for a server without a reloader.
    #[error("Server `{0}` has no reloader")]
    NoReloader(String),

    /// A hot reload cannot move listeners; that takes a restart.
    #[error("Server `{0}` changed its listeners, a restart is required")]
    ListenersChanged(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        ServerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn bind_failed(address: &str, source: std::io::Error) -> Self {
        ServerError::BindFailed {
            address: address.to_string(),
            source,
        }
    }
}
