//! Consecutive reconnect failures per peer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Counts reconnect failures so a peer is given up on exactly once
#[derive(Debug)]
pub struct ReconnectFailureTracker {
    failures: Arc<RwLock<HashMap<String, FailureInfo>>>,
    give_up_after: u32,
    window: Duration,
}

#[derive(Debug, Clone)]
struct FailureInfo {
    count: u32,
    first_failure: Instant,
    last_error: String,
    given_up: bool,
}

/// Result of recording one failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureVerdict {
    /// Failures in the current window
    pub count: u32,
    /// True exactly once, when the count first reaches the limit
    pub give_up: bool,
}

impl ReconnectFailureTracker {
    /// Give up after `give_up_after` failures within `window`
    pub fn new(give_up_after: u32, window: Duration) -> Self {
        Self {
            failures: Arc::new(RwLock::new(HashMap::new())),
            give_up_after: give_up_after.max(1),
            window,
        }
    }

    /// Record a failed attempt for `peer`
    pub async fn record_failure(&self, peer: &str, error: &str) -> FailureVerdict {
        let mut failures = self.failures.write().await;
        let now = Instant::now();
        let info = failures.entry(peer.to_string()).or_insert(FailureInfo {
            count: 0,
            first_failure: now,
            last_error: String::new(),
            given_up: false,
        });

        if now.duration_since(info.first_failure) > self.window {
            info.count = 1;
            info.first_failure = now;
            info.given_up = false;
        } else {
            info.count += 1;
        }
        info.last_error = error.to_string();

        let give_up = info.count >= self.give_up_after && !info.given_up;
        if give_up {
            info.given_up = true;
            warn!(
                "Giving up on peer {} after {} reconnect failures (last: {})",
                peer, info.count, info.last_error
            );
        } else {
            debug!("Reconnect to peer {} failed (count: {})", peer, info.count);
        }
        FailureVerdict {
            count: info.count,
            give_up,
        }
    }

    /// Forget the failures of `peer`; returns whether it had any
    pub async fn clear(&self, peer: &str) -> bool {
        self.failures.write().await.remove(peer).is_some()
    }

    /// Failures currently counted for `peer`
    pub async fn failure_count(&self, peer: &str) -> u32 {
        self.failures
            .read()
            .await
            .get(peer)
            .map(|info| info.count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gives_up_once() {
        let tracker = ReconnectFailureTracker::new(3, Duration::from_secs(60));
        assert!(!tracker.record_failure("b", "refused").await.give_up);
        assert!(!tracker.record_failure("b", "refused").await.give_up);
        let third = tracker.record_failure("b", "refused").await;
        assert_eq!(third, FailureVerdict { count: 3, give_up: true });
        assert!(!tracker.record_failure("b", "refused").await.give_up);
    }

    #[tokio::test]
    async fn test_clear_resets() {
        let tracker = ReconnectFailureTracker::new(2, Duration::from_secs(60));
        tracker.record_failure("b", "eof").await;
        assert!(tracker.clear("b").await);
        assert_eq!(tracker.failure_count("b").await, 0);
        assert!(!tracker.clear("b").await);
    }

    #[tokio::test]
    async fn test_window_expiry_restarts_count() {
        let tracker = ReconnectFailureTracker::new(2, Duration::from_millis(10));
        tracker.record_failure("b", "eof").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.record_failure("b", "eof").await.count, 1);
    }
}
