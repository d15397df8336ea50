//! Loading, checking and watching the TOML configuration.
//!
//! # Data Flow
//! ```text
//! gracehttp.toml
//!     → loader.rs: read and deserialize into GraceConfig
//!     → validation.rs: names unique, addresses parse, TLS paths present
//!
//! Edit on disk:
//!     watcher.rs sees the write, loads and validates again
//!     → coordinator: swap handlers in place, or restart if listeners moved
//! ```
//!
//! # Design Decisions
//! - A loaded `GraceConfig` never mutates; a new one replaces it whole
//! - Every section has defaults so an empty file is a usable config
//! - Serde rejects malformed input, `validation` rejects nonsense input

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{GraceConfig, LogFormat, ObservabilityConfig, ProcessConfig, ServerConfig, TlsConfig};
