//! Live connection accounting for one listener.
//!
//! # Responsibilities
//! - Hand each accepted socket a sequence number for log correlation
//! - Count sockets that are still being served
//! - Let a draining listener wait, bounded, until that count reaches zero
//!
//! # Design Decisions
//! - Counting happens in a drop guard so an early return or a panic in the
//!   connection task can never leak a slot.
//! - The last guard to drop wakes waiters through `Notify`; no polling.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit};

/// Per-listener sequence number of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Shared {
    sequence: AtomicU64,
    live: AtomicU64,
    drained: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    shared: Arc<Shared>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a freshly accepted socket. `permit` is the
    /// connection-limit slot, returned together with the count on drop.
    pub fn track(&self, permit: Option<OwnedSemaphorePermit>) -> ConnectionGuard {
        let seq = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            shared: Arc::clone(&self.shared),
            id: ConnectionId(seq),
            _permit: permit,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.shared.live.load(Ordering::Acquire)
    }

    /// `true` once nothing is tracked; `false` if `grace` ran out first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let shared = &self.shared;
        let drained = async {
            loop {
                // Register before checking so a drop in between is not lost.
                let wakeup = shared.drained.notified();
                if shared.live.load(Ordering::Acquire) == 0 {
                    break;
                }
                wakeup.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

/// Held by the task serving one socket.
#[derive(Debug)]
pub struct ConnectionGuard {
    shared: Arc<Shared>,
    id: ConnectionId,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let before = self.shared.live.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(connection = %self.id, remaining = before - 1, "Connection finished");
        if before == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_accept_order() {
        let tracker = ConnectionTracker::new();
        let a = tracker.track(None);
        let b = tracker.track(None);
        assert!(a.id() < b.id());
        assert_eq!(a.id().to_string(), "c1");
    }

    #[test]
    fn test_guards_drive_the_live_count() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track(None);
        let second = tracker.track(None);
        assert_eq!(tracker.active_count(), 2);
        drop(first);
        assert_eq!(tracker.active_count(), 1);
        drop(second);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_permit_is_returned_with_the_guard() {
        let limit = Arc::new(tokio::sync::Semaphore::new(1));
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(Some(Arc::clone(&limit).try_acquire_owned().unwrap()));
        assert_eq!(limit.available_permits(), 0);
        drop(guard);
        assert_eq!(limit.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_on_last_drop() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(None);
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_idle_gives_up_after_grace() {
        let tracker = ConnectionTracker::new();
        let _held = tracker.track(None);
        assert!(!tracker.wait_idle(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_idle_tracker_returns_immediately() {
        assert!(ConnectionTracker::new().wait_idle(Duration::ZERO).await);
    }
}
