//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (any time, serialized by a write lock):
//!     (method, domain, pattern, priority)
//!     → pattern.rs (compile segments, derive priority)
//!     → tree.rs (walk/create nodes, append binding, re-sort)
//!     → cache.rs (wholesale invalidation)
//!
//! Incoming Request (method, host, path)
//!     → cache.rs (exact key lookup, generation checked)
//!     → router.rs (best binding) / hooks.rs (all bindings)
//!     → Return: Found(binding, params) or NotFound
//! ```
//!
//! # Design Decisions
//! - Deterministic: priority descending, then registration order
//! - NotFound is cached like any other outcome
//! - Any insert drops the whole cache; partial invalidation is not attempted

use std::sync::Arc;

pub mod cache;
pub mod hooks;
pub mod pattern;
pub mod router;
pub mod tree;

pub use hooks::{HookEvent, HookMatch, HookTree};
pub use pattern::{compile, parse_route, CompiledPattern, Params, RouteMethod, ANY_DOMAIN};
pub use router::{Resolution, RouteMatch, RouteTree};
pub use tree::Binding;

/// Value stored in a tree: cheap to clone, comparable by identity.
pub trait Target: Clone + Send + Sync + 'static {
    /// True when both values refer to the same handler.
    fn same_target(&self, other: &Self) -> bool;
}

impl<T: ?Sized + Send + Sync + 'static> Target for Arc<T> {
    fn same_target(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(self), Arc::as_ptr(other))
    }
}
