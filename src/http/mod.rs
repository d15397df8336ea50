//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP/TLS connection
//!     → server.rs (hyper HTTP/1.1, middleware stack, dispatcher)
//!     → request.rs (buffered request view, host, request ID)
//!     → table.rs (route resolution, hook sequence, status handlers)
//!     → handler.rs (application handlers and hooks)
//!     → response.rs (converted once, after BeforeOutput hooks)
//!     → Send to client
//! ```

pub mod handler;
pub mod request;
pub mod response;
pub mod server;
pub mod table;

pub use handler::{Handler, Hook, MethodTable};
pub use request::{Request, X_REQUEST_ID};
pub use response::Response;
pub use server::{Reloader, Server};
pub use table::RouteTable;
