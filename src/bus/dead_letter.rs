//! Dead letter queue: diagnostic sink for undeliverable or failed messages.
//!
//! Entries are retained (bounded, oldest dropped) for inspection and fed to a
//! drain task that only logs them. Nothing here retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::Message;

/// Why a message was dead-lettered.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Recipient has no active subscription.
    NoSubscriber,
    /// Recipient queue was at capacity.
    QueueFull,
    /// Recipient queue's consumer has gone away.
    QueueClosed,
    /// The subscriber returned an error or panicked.
    HandlerFailed,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::NoSubscriber => write!(f, "no_subscriber"),
            DeadLetterReason::QueueFull => write!(f, "queue_full"),
            DeadLetterReason::QueueClosed => write!(f, "queue_closed"),
            DeadLetterReason::HandlerFailed => write!(f, "handler_failed"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: DeadLetterReason,
    /// Handler error text, when there was one.
    pub error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

pub(crate) struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
    total: AtomicU64,
    feed: mpsc::Sender<DeadLetter>,
    feed_rx: Mutex<Option<mpsc::Receiver<DeadLetter>>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (feed, feed_rx) = mpsc::channel(capacity);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
            feed,
            feed_rx: Mutex::new(Some(feed_rx)),
        }
    }

    pub fn push(&self, message: Message, reason: DeadLetterReason, error: Option<String>) {
        let entry = DeadLetter {
            message,
            reason,
            error,
            dead_lettered_at: Utc::now(),
        };

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        // The feed only exists to be logged; dropping when nobody drains is fine.
        let _ = self.feed.try_send(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    /// Spawn the logging drain. Returns `None` if one is already running.
    ///
    /// The task yields the feed receiver back when it stops; pass it to
    /// [`DeadLetterQueue::restore_feed`] so a later start can drain again.
    pub fn spawn_drain(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<mpsc::Receiver<DeadLetter>>> {
        let mut rx = self
            .feed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    entry = rx.recv() => match entry {
                        Some(entry) => log_dead_letter(&entry),
                        None => break,
                    },
                }
            }
            debug!("Dead letter drain stopped");
            rx
        }))
    }

    pub fn restore_feed(&self, rx: mpsc::Receiver<DeadLetter>) {
        *self.feed_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
    }
}

fn log_dead_letter(entry: &DeadLetter) {
    match &entry.error {
        Some(error) => warn!(
            "Dead letter {} ({} -> {}, type {}): {}: {}",
            entry.message.id(),
            entry.message.sender(),
            entry.message.recipient(),
            entry.message.message_type(),
            entry.reason,
            error
        ),
        None => warn!(
            "Dead letter {} ({} -> {}, type {}): {}",
            entry.message.id(),
            entry.message.sender(),
            entry.message.recipient(),
            entry.message.message_type(),
            entry.reason
        ),
    }
}
