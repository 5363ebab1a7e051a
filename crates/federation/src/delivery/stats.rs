//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts of delivery outcomes since startup.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    /// Jobs handed to the queue
    pub queued: AtomicU64,
    /// 2xx responses
    pub delivered: AtomicU64,
    /// Terminal and retryable failures
    pub failed: AtomicU64,
    /// Jobs dropped before a request was made
    pub skipped: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStatsSnapshot {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl DeliveryStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&self, count: u64) {
        self.queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = DeliveryStats::new();
        stats.record_queued(3);
        stats.record_delivered();
        stats.record_skipped();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queued, 3);
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.skipped, 1);
    }
}
