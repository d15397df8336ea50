//! Per-server lifecycle state machine.
//!
//! # State Transitions
//! ```text
//! Stopped → Starting → Running → Reloading → Running
//!                         │
//!                         └────→ Draining → Stopped
//! Starting → Stopped   (every listener failed to bind)
//! ```

use tokio::sync::watch;

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Draining,
}

impl ServerState {
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Reloading)
                | (Reloading, Running)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }
}

/// Observable state holder; transitions are checked and atomic.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ServerState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServerState::Stopped);
        Self { tx }
    }

    pub fn current(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Move to `next`, failing if the edge is not part of the machine.
    pub fn transition(&self, next: ServerState) -> Result<ServerState, ServerError> {
        let mut from = ServerState::Stopped;
        let moved = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = ?from, to = ?next, "Server state changed");
            Ok(from)
        } else if from == ServerState::Reloading && next == ServerState::Reloading {
            Err(ServerError::RestartInProgress)
        } else {
            Err(ServerError::InvalidTransition { from, to: next })
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for(&self, pred: impl Fn(ServerState) -> bool) -> ServerState {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| pred(*s)).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.current(),
        };
        state
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = StateMachine::new();
        sm.transition(ServerState::Starting).unwrap();
        sm.transition(ServerState::Running).unwrap();
        sm.transition(ServerState::Reloading).unwrap();
        sm.transition(ServerState::Running).unwrap();
        sm.transition(ServerState::Draining).unwrap();
        sm.transition(ServerState::Stopped).unwrap();
        assert_eq!(sm.current(), ServerState::Stopped);
    }

    #[test]
    fn test_second_reload_rejected() {
        let sm = StateMachine::new();
        sm.transition(ServerState::Starting).unwrap();
        sm.transition(ServerState::Running).unwrap();
        sm.transition(ServerState::Reloading).unwrap();
        assert!(matches!(
            sm.transition(ServerState::Reloading),
            Err(ServerError::RestartInProgress)
        ));
        assert!(matches!(
            sm.transition(ServerState::Draining),
            Err(ServerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let sm = std::sync::Arc::new(StateMachine::new());
        let waiter = {
            let sm = sm.clone();
            tokio::spawn(async move { sm.wait_for(|s| s == ServerState::Running).await })
        };
        sm.transition(ServerState::Starting).unwrap();
        sm.transition(ServerState::Running).unwrap();
        assert_eq!(waiter.await.unwrap(), ServerState::Running);
    }
}
