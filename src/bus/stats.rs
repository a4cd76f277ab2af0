//! Bus counters and the statistics snapshot built from them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the bus counters.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BusStatistics {
    /// Messages accepted into a recipient queue (broadcast copies counted individually).
    pub messages_sent: u64,
    /// Messages whose handler completed successfully.
    pub messages_delivered: u64,
    /// Undeliverable messages plus handler failures.
    pub messages_failed: u64,
    /// Messages rejected because their TTL had elapsed.
    pub messages_expired: u64,
    pub broadcasts_sent: u64,
    pub replies_resolved: u64,
    /// Dead letters recorded since the bus was created.
    pub dead_lettered: u64,
    pub active_subscribers: usize,
    pub broadcast_subscribers: usize,
    /// Dead letters currently retained for inspection.
    pub dead_letter_queue_size: usize,
    pub message_history_size: usize,
}

#[derive(Debug, Default)]
pub(crate) struct BusCounters {
    pub sent: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub expired: AtomicU64,
    pub broadcasts: AtomicU64,
    pub replies: AtomicU64,
}

impl BusCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Fill the counter fields of a snapshot; gauges are filled by the bus.
    pub fn snapshot(&self) -> BusStatistics {
        BusStatistics {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            messages_expired: self.expired.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts.load(Ordering::Relaxed),
            replies_resolved: self.replies.load(Ordering::Relaxed),
            ..BusStatistics::default()
        }
    }
}
