//! Sockets: binding, inheriting, accepting.
//!
//! # Data Flow
//! ```text
//! address from config  or  descriptor from the predecessor
//!     → inherit.rs: bind fresh, or adopt the inherited fd
//!     → listener.rs: accept loop under a connection limit
//!     → tls.rs: handshake for https entries
//!     → connection.rs: live count, used to bound draining
//!     → http::server serves the stream
//! ```
//!
//! # Design Decisions
//! - A semaphore caps concurrent connections per listener
//! - Draining stops accepting first, then waits on the live count
//! - http and https listeners share one accept loop

pub mod connection;
pub mod inherit;
pub mod listener;
pub mod tls;

pub use inherit::{inheritance_supported, Descriptor, InheritableListener};
pub use listener::{Accepted, ListenerRecord, ListenerSet, ListenerState};
