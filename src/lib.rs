//! Graceful multi-listener HTTP server core.

pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod registry;
pub mod routing;
pub mod runtime;

pub use config::GraceConfig;
pub use error::ServerError;
pub use http::{Request, Response, RouteTable, Server};
pub use lifecycle::{ProcessCoordinator, ServerState, Shutdown};
pub use registry::ServerRegistry;
pub use routing::{HookEvent, Resolution, RouteTree};
