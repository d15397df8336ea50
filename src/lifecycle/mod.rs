//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Cli → role (role.rs)
//!         coordinator: spawn worker group, forward signals (supervisor.rs)
//!         worker: take FdMap (fdmap.rs) → start servers → report ready (readiness.rs)
//!
//! Signals (signals.rs):
//!     SIGUSR2 → restart: hand listeners to a successor (coordinator.rs)
//!     SIGHUP → reload: swap route tables in place
//!     SIGTERM/SIGINT → shutdown: drain every server
//!
//! Per server (state.rs):
//!     Stopped → Starting → Running → Reloading → Running
//!                                  → Draining → Stopped
//! ```
//!
//! # Design Decisions
//! - A predecessor drains only after its successor reported ready
//! - Drains are bounded by the graceful timeout; stragglers are aborted
//! - Completion fires once every server stopped and no restart is in flight

pub mod coordinator;
pub mod fdmap;
pub mod readiness;
pub mod role;
pub mod shutdown;
pub mod signals;
pub mod state;
pub mod supervisor;

pub use coordinator::{ProcessCoordinator, RestartMode};
pub use fdmap::{FdMap, Handoff, InheritedEntry, FDMAP_ENV};
pub use readiness::ReadinessNotifier;
pub use role::ProcessRole;
pub use shutdown::Shutdown;
pub use signals::{ProcessSignal, Signals};
pub use state::{ServerState, StateMachine};
