//! Network statistics shared between the application and network threads

use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

/// Counters updated by the network thread and read by the application thread
///
/// All updates use relaxed ordering; the counters are observational and
/// never drive control flow.
#[derive(Debug, Default)]
pub struct NetworkStats {
    messages_routed: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    hook_failures: AtomicU64,
    quarantined: AtomicU64,
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application message handed to a communicator
    pub fn record_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Peer message forwarded to the application
    pub fn record_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Application message with no live communicator to take it
    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantine(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> NetworkStatsSnapshot {
        NetworkStatsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`NetworkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatsSnapshot {
    pub messages_routed: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub heartbeat_timeouts: u64,
    pub hook_failures: u64,
    pub quarantined: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = NetworkStats::new();
        stats.record_routed();
        stats.record_routed();
        stats.record_delivered();
        stats.record_hook_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_routed, 2);
        assert_eq!(snapshot.messages_delivered, 1);
        assert_eq!(snapshot.hook_failures, 1);
        assert_eq!(snapshot.quarantined, 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = NetworkStats::new();
        let before = stats.snapshot();
        stats.record_dropped();
        assert_eq!(before.messages_dropped, 0);
        assert_eq!(stats.snapshot().messages_dropped, 1);
    }
}
