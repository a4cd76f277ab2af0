//! Message routing between agents.

use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
use super::stats::{BusCounters, BusStatistics};
use super::subscriber::Subscriber;
use crate::config::BusConfig;
use crate::error::panic_message;
use crate::protocol::Message;

/// How long a stopping subscription may take before its task is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Subscription {
    tx: mpsc::Sender<Message>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    async fn close(self, agent_id: &str) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("Message processor for {} did not stop in time, aborting", agent_id);
            task.abort();
            let _ = task.await;
        }
    }
}

struct PendingReply {
    request_id: String,
    tx: oneshot::Sender<Message>,
}

struct Drain {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<mpsc::Receiver<DeadLetter>>,
}

/// State shared with the per-subscription processing tasks.
struct BusShared {
    counters: BusCounters,
    dead_letters: DeadLetterQueue,
}

impl BusShared {
    fn fail(&self, message: Message, reason: DeadLetterReason, error: Option<String>) {
        BusCounters::incr(&self.counters.failed);
        self.dead_letters.push(message, reason, error);
    }
}

/// Routes messages to per-agent queues and broadcast members.
///
/// Every subscription owns a bounded queue drained by a single task, so
/// messages to one recipient are handled in send order. Senders never block:
/// a full queue dead-letters the message instead.
pub struct MessageBus {
    config: BusConfig,
    subscribers: DashMap<String, Subscription>,
    broadcast_members: DashSet<String>,
    pending_replies: DashMap<String, PendingReply>,
    history: Mutex<VecDeque<Message>>,
    shared: Arc<BusShared>,
    drain: tokio::sync::Mutex<Option<Drain>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let shared = Arc::new(BusShared {
            counters: BusCounters::default(),
            dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
        });
        Self {
            config,
            subscribers: DashMap::new(),
            broadcast_members: DashSet::new(),
            pending_replies: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            shared,
            drain: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the dead letter drain.
    pub async fn start(&self) {
        let mut drain = self.drain.lock().await;
        if drain.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        match self.shared.dead_letters.spawn_drain(shutdown_rx) {
            Some(task) => {
                *drain = Some(Drain { shutdown, task });
                info!("Message bus started");
            }
            None => warn!("Dead letter drain already attached"),
        }
    }

    /// Stop every subscription and the dead letter drain, awaiting each task.
    pub async fn stop(&self) {
        let agent_ids: Vec<String> = self.subscribers.iter().map(|s| s.key().clone()).collect();
        for agent_id in agent_ids {
            if let Some((_, subscription)) = self.subscribers.remove(&agent_id) {
                subscription.close(&agent_id).await;
            }
        }
        self.broadcast_members.clear();
        // Dropping the senders resolves outstanding waiters with no reply.
        self.pending_replies.clear();

        if let Some(drain) = self.drain.lock().await.take() {
            let _ = drain.shutdown.send(true);
            match drain.task.await {
                Ok(feed) => self.shared.dead_letters.restore_feed(feed),
                Err(e) => error!("Dead letter drain ended abnormally: {}", e),
            }
        }
        info!("Message bus stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.drain.lock().await.is_some()
    }

    /// Register `subscriber` as the consumer of messages addressed to `agent_id`.
    ///
    /// Subscribing an id again replaces the previous registration; its task is
    /// stopped and awaited and anything still queued for it is dropped.
    pub async fn subscribe(&self, agent_id: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(process_queue(
            agent_id.clone(),
            rx,
            shutdown_rx,
            subscriber,
            self.shared.clone(),
        ));

        let previous = self
            .subscribers
            .insert(agent_id.clone(), Subscription { tx, shutdown, task });
        if let Some(previous) = previous {
            debug!("Replacing existing subscription for {}", agent_id);
            previous.close(&agent_id).await;
        }
        debug!("Agent {} subscribed to message bus", agent_id);
    }

    /// Cancel the subscription and broadcast membership of `agent_id`.
    pub async fn unsubscribe(&self, agent_id: &str) -> bool {
        self.broadcast_members.remove(agent_id);
        match self.subscribers.remove(agent_id) {
            Some((_, subscription)) => {
                subscription.close(agent_id).await;
                debug!("Agent {} unsubscribed from message bus", agent_id);
                true
            }
            None => false,
        }
    }

    pub fn subscribe_to_broadcasts(&self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        debug!("Agent {} subscribed to broadcasts", agent_id);
        self.broadcast_members.insert(agent_id);
    }

    pub fn unsubscribe_from_broadcasts(&self, agent_id: &str) -> bool {
        self.broadcast_members.remove(agent_id).is_some()
    }

    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subscribers.contains_key(agent_id)
    }

    pub fn subscribed_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscribers.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn broadcast_subscribers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.broadcast_members.iter().map(|m| m.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Route a message to its recipient.
    ///
    /// Returns false without enqueuing when the message has expired; returns
    /// false and dead-letters it when no queue can accept it. A message that
    /// answers a pending [`MessageBus::send_with_reply`] goes to that waiter only.
    pub fn send(&self, message: Message) -> bool {
        if message.is_expired() {
            BusCounters::incr(&self.shared.counters.expired);
            warn!("Message {} has expired", message.id());
            return false;
        }
        self.record(&message);

        let message = match self.resolve_reply(message) {
            Some(message) => message,
            None => return true,
        };

        match self.enqueue(message.recipient(), message.clone()) {
            Ok(()) => {
                BusCounters::incr(&self.shared.counters.sent);
                debug!("Message {} sent to {}", message.id(), message.recipient());
                true
            }
            Err(reason) => {
                warn!(
                    "Message {} to {} not delivered: {}",
                    message.id(),
                    message.recipient(),
                    reason
                );
                self.shared.fail(message, reason, None);
                false
            }
        }
    }

    /// Enqueue a copy of `message` for every broadcast member.
    ///
    /// Returns true iff at least one member received it.
    pub fn broadcast(&self, message: Message) -> bool {
        if message.is_expired() {
            BusCounters::incr(&self.shared.counters.expired);
            warn!("Broadcast message {} has expired", message.id());
            return false;
        }
        self.record(&message);
        BusCounters::incr(&self.shared.counters.broadcasts);

        let members = self.broadcast_subscribers();
        let mut delivered = 0u64;
        for member in &members {
            match self.enqueue(member, message.clone()) {
                Ok(()) => delivered += 1,
                // Members without a live queue simply miss broadcasts.
                Err(DeadLetterReason::NoSubscriber) => {}
                Err(reason) => {
                    warn!("Broadcast {} not delivered to {}: {}", message.id(), member, reason);
                    self.shared.fail(message.clone(), reason, None);
                }
            }
        }

        BusCounters::add(&self.shared.counters.sent, delivered);
        debug!("Broadcast message {} sent to {} agents", message.id(), delivered);
        delivered > 0
    }

    /// Send `message` under a fresh correlation id and wait for the reply.
    ///
    /// Returns `None` if the message could not be sent or no reply arrived
    /// within `timeout`.
    pub async fn send_with_reply(&self, message: Message, timeout: Duration) -> Option<Message> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = message.with_correlation_id(correlation_id.clone());
        let message_id = message.id().to_string();

        let (tx, rx) = oneshot::channel();
        self.pending_replies.insert(
            correlation_id.clone(),
            PendingReply {
                request_id: message_id.clone(),
                tx,
            },
        );

        if !self.send(message) {
            self.pending_replies.remove(&correlation_id);
            return None;
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!("Timeout waiting for reply to message {}", message_id);
                None
            }
        };
        self.pending_replies.remove(&correlation_id);
        reply
    }

    pub fn statistics(&self) -> BusStatistics {
        let mut stats = self.shared.counters.snapshot();
        stats.dead_lettered = self.shared.dead_letters.total();
        stats.dead_letter_queue_size = self.shared.dead_letters.len();
        stats.active_subscribers = self.subscribers.len();
        stats.broadcast_subscribers = self.broadcast_members.len();
        stats.message_history_size = self.lock_history().len();
        stats
    }

    /// Up to `limit` of the most recent messages, oldest first.
    pub fn message_history(&self, limit: usize) -> Vec<Message> {
        let history = self.lock_history();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead_letters.entries()
    }

    pub fn clear_dead_letters(&self) -> usize {
        let cleared = self.shared.dead_letters.clear();
        info!("Cleared {} dead letters", cleared);
        cleared
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, message: &Message) {
        if self.config.max_history == 0 {
            return;
        }
        let mut history = self.lock_history();
        if history.len() >= self.config.max_history {
            history.pop_front();
        }
        history.push_back(message.clone());
    }

    /// Hand `message` to a waiting requester. Gives it back if nobody waits for it.
    fn resolve_reply(&self, message: Message) -> Option<Message> {
        let Some(correlation_id) = message.correlation_id() else {
            return Some(message);
        };
        let waiter = self
            .pending_replies
            .remove_if(correlation_id, |_, pending| pending.request_id != message.id());

        match waiter {
            Some((_, pending)) => {
                BusCounters::incr(&self.shared.counters.replies);
                debug!("Message {} resolved reply to {}", message.id(), pending.request_id);
                if pending.tx.send(message).is_err() {
                    debug!("Reply arrived after its requester gave up");
                }
                None
            }
            None => Some(message),
        }
    }

    fn enqueue(&self, agent_id: &str, message: Message) -> Result<(), DeadLetterReason> {
        let Some(subscription) = self.subscribers.get(agent_id) else {
            return Err(DeadLetterReason::NoSubscriber);
        };
        match subscription.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeadLetterReason::QueueFull),
            Err(TrySendError::Closed(_)) => Err(DeadLetterReason::QueueClosed),
        }
    }
}

/// Drain one subscription queue until shut down.
async fn process_queue(
    agent_id: String,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
    subscriber: Arc<dyn Subscriber>,
    shared: Arc<BusShared>,
) {
    debug!("Message processor started for {}", agent_id);
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if message.is_expired() {
            BusCounters::incr(&shared.counters.expired);
            warn!("Message {} expired while queued for {}", message.id(), agent_id);
            continue;
        }

        let delivery = AssertUnwindSafe(subscriber.deliver(message.clone())).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("Message {} dropped by shutdown of {}", message.id(), agent_id);
                break;
            }
            outcome = delivery => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                BusCounters::incr(&shared.counters.delivered);
                debug!("Message {} delivered to {}", message.id(), agent_id);
            }
            Ok(Err(e)) => {
                error!("Error processing message {} for {}: {:#}", message.id(), agent_id, e);
                shared.fail(message, DeadLetterReason::HandlerFailed, Some(format!("{:#}", e)));
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("Handler for {} {} on message {}", agent_id, reason, message.id());
                shared.fail(message, DeadLetterReason::HandlerFailed, Some(reason));
            }
        }
    }
    debug!("Message processor stopped for {}", agent_id);
}
