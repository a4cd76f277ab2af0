//! Agent lifecycle: status transitions, the private processing loop and
//! message handling with metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{AgentContext, MessageHandler};
use super::metrics::{AgentMetrics, HealthSnapshot, ProcessOutcome};
use super::status::{AgentStatus, StatusChange, StatusObserver};
use crate::bus::{MessageBus, Subscriber};
use crate::context::ContextStore;
use crate::error::{panic_message, Error, Result};
use crate::protocol::{Message, Payload, Priority};

/// How long a stopping processing loop may take before it is aborted.
const LOOP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_QUEUE_CAPACITY: usize = 1000;

struct ProcessingLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Bus subscriber that forwards into the agent's private inbox.
struct Inbox {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl Subscriber for Inbox {
    async fn deliver(&self, message: Message) -> anyhow::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("agent inbox closed"))
    }
}

struct AgentCore {
    id: String,
    handler: Arc<dyn MessageHandler>,
    capabilities: Vec<String>,
    dependencies: Vec<String>,
    priority: Priority,
    queue_capacity: usize,
    receives_broadcasts: bool,
    status: watch::Sender<AgentStatus>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
    metrics: Mutex<AgentMetrics>,
    error_count: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    services: RwLock<Option<AgentContext>>,
}

impl AgentCore {
    fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    /// Apply `to` if the state machine allows it, then notify observers.
    fn transition(&self, to: AgentStatus) -> Result<()> {
        let mut from = AgentStatus::Stopped;
        let mut allowed = false;
        self.status.send_if_modified(|current| {
            from = *current;
            allowed = current.can_transition_to(to);
            if allowed {
                *current = to;
            }
            allowed
        });

        if !allowed {
            return Err(Error::InvalidTransition {
                agent: self.id.clone(),
                from,
                to,
            });
        }

        debug!("Agent {} status {} -> {}", self.id, from, to);
        let change = StatusChange {
            agent_id: self.id.clone(),
            from,
            to,
            at: Utc::now(),
        };
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for observer in observers {
            observer.on_status_change(&change);
        }
        Ok(())
    }

    fn services(&self) -> Option<AgentContext> {
        self.services.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Injected services, or private defaults created on first use.
    fn services_or_default(&self) -> AgentContext {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services
            .get_or_insert_with(|| {
                debug!("Agent {} using private bus and context store", self.id);
                AgentContext::new(
                    self.id.clone(),
                    Arc::new(MessageBus::default()),
                    Arc::new(ContextStore::default()),
                )
            })
            .clone()
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, AgentMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn process(&self, message: &Message) -> ProcessOutcome {
        let services = self.services_or_default();
        let started = Instant::now();
        self.lock_metrics().touch(Utc::now());

        let result = AssertUnwindSafe(self.handler.handle(message, &services))
            .catch_unwind()
            .await;
        let processing_time = started.elapsed();

        let failure = match result {
            Ok(Ok(data)) => {
                self.lock_metrics().record_success(processing_time);
                debug!(
                    "Agent {} processed {} ({}) in {:?}",
                    self.id,
                    message.id(),
                    message.message_type(),
                    processing_time
                );
                return ProcessOutcome {
                    message_id: message.id().to_string(),
                    success: true,
                    data,
                    error: None,
                    processing_time,
                };
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };

        self.lock_metrics().record_failure();
        self.error_count.fetch_add(1, Ordering::Relaxed);
        error!(
            "Agent {} failed to process message {}: {}",
            self.id,
            message.id(),
            failure
        );

        let mut data = Payload::new();
        data.insert("success".to_string(), false.into());
        data.insert("error".to_string(), failure.clone().into());
        ProcessOutcome {
            message_id: message.id().to_string(),
            success: false,
            data,
            error: Some(failure),
            processing_time,
        }
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    id: String,
    handler: Arc<dyn MessageHandler>,
    capabilities: Vec<String>,
    dependencies: Vec<String>,
    priority: Priority,
    queue_capacity: usize,
    receives_broadcasts: bool,
}

impl AgentBuilder {
    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Ids of agents that must be running before this one starts.
    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Capacity of the private inbox and of the deferral buffer used while paused.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Whether the agent joins the bus broadcast list while running (default true).
    pub fn receives_broadcasts(mut self, receives: bool) -> Self {
        self.receives_broadcasts = receives;
        self
    }

    pub fn build(self) -> Agent {
        let (status, _) = watch::channel(AgentStatus::Stopped);
        Agent {
            core: Arc::new(AgentCore {
                id: self.id,
                handler: self.handler,
                capabilities: self.capabilities,
                dependencies: self.dependencies,
                priority: self.priority,
                queue_capacity: self.queue_capacity,
                receives_broadcasts: self.receives_broadcasts,
                status,
                observers: RwLock::new(Vec::new()),
                metrics: Mutex::new(AgentMetrics::default()),
                error_count: AtomicU64::new(0),
                started_at: Mutex::new(None),
                services: RwLock::new(None),
            }),
            processing: tokio::sync::Mutex::new(None),
        }
    }
}

/// A long-lived unit that receives messages through the bus and hands them,
/// one at a time, to its [`MessageHandler`].
///
/// Lifecycle calls are serialized per agent; status, metrics and health can
/// be read at any time.
pub struct Agent {
    core: Arc<AgentCore>,
    processing: tokio::sync::Mutex<Option<ProcessingLoop>>,
}

impl Agent {
    pub fn new(id: impl Into<String>, handler: impl MessageHandler + 'static) -> Self {
        Self::builder(id, handler).build()
    }

    pub fn builder(id: impl Into<String>, handler: impl MessageHandler + 'static) -> AgentBuilder {
        Self::builder_with(id, Arc::new(handler))
    }

    /// Builder for a handler that is already shared.
    pub fn builder_with(id: impl Into<String>, handler: Arc<dyn MessageHandler>) -> AgentBuilder {
        AgentBuilder {
            id: id.into(),
            handler,
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            priority: Priority::Normal,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            receives_broadcasts: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.core.capabilities
    }

    pub fn dependencies(&self) -> &[String] {
        &self.core.dependencies
    }

    pub fn priority(&self) -> Priority {
        self.core.priority
    }

    pub fn status(&self) -> AgentStatus {
        self.core.status()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.core.status.subscribe()
    }

    pub fn add_status_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.core
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Use shared services instead of private defaults. Takes effect on the next start.
    pub fn attach(&self, bus: Arc<MessageBus>, context: Arc<ContextStore>) {
        let services = AgentContext::new(self.core.id.clone(), bus, context);
        *self
            .core
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(services);
    }

    /// The services the agent runs against, if attached or already started.
    pub fn services(&self) -> Option<AgentContext> {
        self.core.services()
    }

    /// Start the agent: subscribe, spawn the processing loop, run the start hook.
    ///
    /// Allowed from stopped or error. On failure the agent is left in error.
    pub async fn start(&self) -> Result<()> {
        let mut processing = self.processing.lock().await;
        self.core.transition(AgentStatus::Starting)?;
        info!("Starting agent {}", self.core.id);

        match self.start_inner(&mut processing).await {
            Ok(()) => {
                *self
                    .core
                    .started_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
                self.core.transition(AgentStatus::Running)?;
                info!("Agent {} started", self.core.id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start agent {}: {}", self.core.id, e);
                self.core.error_count.fetch_add(1, Ordering::Relaxed);
                self.teardown(&mut processing).await;
                let _ = self.core.transition(AgentStatus::Error);
                Err(e)
            }
        }
    }

    async fn start_inner(&self, processing: &mut Option<ProcessingLoop>) -> Result<()> {
        // Restarting from error: drop whatever the failed run left behind.
        self.teardown(processing).await;

        let services = self.core.services_or_default();
        let (tx, rx) = mpsc::channel(self.core.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self.core.clone(), rx, shutdown_rx));
        *processing = Some(ProcessingLoop { shutdown, task });

        services
            .bus()
            .subscribe(self.core.id.clone(), Arc::new(Inbox { tx }))
            .await;
        if self.core.receives_broadcasts {
            services.bus().subscribe_to_broadcasts(self.core.id.clone());
        }

        match AssertUnwindSafe(self.core.handler.on_start(&services))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::lifecycle(&self.core.id, format!("start hook: {:#}", e))),
            Err(panic) => Err(Error::lifecycle(
                &self.core.id,
                format!("start hook {}", panic_message(panic.as_ref())),
            )),
        }
    }

    /// Unsubscribe and stop the processing loop, waiting for it to end.
    async fn teardown(&self, processing: &mut Option<ProcessingLoop>) {
        if let Some(services) = self.core.services() {
            services.bus().unsubscribe(&self.core.id).await;
        }

        let Some(running) = processing.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        let mut task = running.task;
        if tokio::time::timeout(LOOP_SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("Processing loop of {} did not stop in time, aborting", self.core.id);
            task.abort();
            let _ = task.await;
        }
    }

    /// Stop the agent. A no-op on an agent that is already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut processing = self.processing.lock().await;
        if self.status() == AgentStatus::Stopped {
            debug!("Agent {} already stopped", self.core.id);
            return Ok(());
        }

        self.core.transition(AgentStatus::ShuttingDown)?;
        info!("Stopping agent {}", self.core.id);
        self.teardown(&mut processing).await;

        let services = self.core.services_or_default();
        let hook = AssertUnwindSafe(self.core.handler.on_stop(&services))
            .catch_unwind()
            .await;
        let failure = match hook {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("stop hook: {:#}", e)),
            Err(panic) => Some(format!("stop hook {}", panic_message(panic.as_ref()))),
        };

        match failure {
            None => {
                self.core.transition(AgentStatus::Stopped)?;
                info!("Agent {} stopped", self.core.id);
                Ok(())
            }
            Some(reason) => {
                error!("Failed to stop agent {}: {}", self.core.id, reason);
                self.core.error_count.fetch_add(1, Ordering::Relaxed);
                let _ = self.core.transition(AgentStatus::Error);
                Err(Error::lifecycle(&self.core.id, reason))
            }
        }
    }

    /// Stop handing messages to the handler; they are deferred until resumed.
    pub async fn pause(&self) -> Result<()> {
        let _guard = self.processing.lock().await;
        self.core.transition(AgentStatus::Paused)?;
        info!("Agent {} paused", self.core.id);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let _guard = self.processing.lock().await;
        self.core.transition(AgentStatus::Running)?;
        info!("Agent {} resumed", self.core.id);
        Ok(())
    }

    /// Flag an unrecoverable runtime failure; the agent moves to error.
    pub fn report_error(&self, reason: &str) -> Result<()> {
        self.core.transition(AgentStatus::Error)?;
        self.core.error_count.fetch_add(1, Ordering::Relaxed);
        error!("Agent {} entered error state: {}", self.core.id, reason);
        Ok(())
    }

    /// Handle one message directly, bypassing the queue.
    ///
    /// Never fails: handler errors and panics become a failed outcome.
    pub async fn process(&self, message: &Message) -> ProcessOutcome {
        self.core.process(message).await
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.core.lock_metrics().clone()
    }

    pub fn health(&self) -> HealthSnapshot {
        let status = self.status();
        let started_at = *self
            .core
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let uptime = match started_at {
            Some(at) if status.is_active() => (Utc::now() - at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            _ => 0.0,
        };

        HealthSnapshot {
            agent_id: self.core.id.clone(),
            status,
            started_at,
            uptime,
            error_count: self.core.error_count.load(Ordering::Relaxed),
            capabilities: self.core.capabilities.clone(),
            metrics: self.metrics(),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.core.id)
            .field("status", &self.status())
            .field("capabilities", &self.core.capabilities)
            .field("dependencies", &self.core.dependencies)
            .finish_non_exhaustive()
    }
}

/// Private processing loop. Handles messages while running; while paused or
/// still starting, parks them in a bounded buffer that is replayed on resume.
async fn run_loop(
    core: Arc<AgentCore>,
    mut inbox: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut status = core.status.subscribe();
    let mut deferred: VecDeque<Message> = VecDeque::new();

    loop {
        let running = *status.borrow_and_update() == AgentStatus::Running;

        let replay = if running { deferred.pop_front() } else { None };
        let message = match replay {
            Some(message) => message,
            None => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    received = inbox.recv() => match received {
                        Some(message) if running => message,
                        Some(message) => {
                            if deferred.len() >= core.queue_capacity {
                                if let Some(dropped) = deferred.pop_front() {
                                    warn!("Agent {} deferral buffer full, dropping {}", core.id, dropped.id());
                                }
                            }
                            deferred.push_back(message);
                            continue;
                        }
                        None => break,
                    },
                }
            }
        };

        if message.is_expired() {
            debug!("Agent {} skipping expired message {}", core.id, message.id());
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("Agent {} dropping in-flight message {}", core.id, message.id());
                break;
            }
            _ = core.process(&message) => {}
        }
    }
    debug!("Processing loop of {} stopped", core.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload;
    use crate::test_util::eventually;
    use std::sync::atomic::AtomicUsize;

    /// Records every message it sees; fails on "fail", panics on "panic".
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    seen: seen.clone(),
                    fail_start: false,
                },
                seen,
            )
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &Message, ctx: &AgentContext) -> anyhow::Result<Payload> {
            self.seen.lock().unwrap().push(message.message_type().to_string());
            match message.message_type() {
                "fail" => anyhow::bail!("refused"),
                "panic" => panic!("boom"),
                "ask" => {
                    ctx.reply(message, "answer", Payload::new());
                    Ok(Payload::new())
                }
                _ => Ok(payload([("echo", message.message_type().into())])),
            }
        }

        async fn on_start(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            if self.fail_start {
                anyhow::bail!("missing credentials");
            }
            Ok(())
        }
    }

    fn shared_services() -> (Arc<MessageBus>, Arc<ContextStore>) {
        (Arc::new(MessageBus::default()), Arc::new(ContextStore::default()))
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (handler, _) = Recorder::new();
        let agent = Agent::builder("chat", handler)
            .capabilities(["conversation"])
            .build();
        let (bus, context) = shared_services();
        agent.attach(bus.clone(), context);

        agent.start().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Running);
        assert!(bus.is_subscribed("chat"));
        assert_eq!(bus.broadcast_subscribers(), vec!["chat".to_string()]);
        assert!(agent.health().started_at.is_some());

        agent.stop().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Stopped);
        assert!(!bus.is_subscribed("chat"));
        assert!(bus.broadcast_subscribers().is_empty());
    }

    #[tokio::test]
    async fn test_stop_never_started_is_ok() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("idle", handler);
        agent.stop().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_without_services_uses_defaults() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("solo", handler);
        agent.start().await.unwrap();

        let services = agent.services().unwrap();
        assert!(services.bus().is_subscribed("solo"));
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("a", handler);
        agent.start().await.unwrap();

        let err = agent.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: AgentStatus::Running,
                to: AgentStatus::Starting,
                ..
            }
        ));
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_start_hook_leaves_error() {
        let (mut handler, _) = Recorder::new();
        handler.fail_start = true;
        let agent = Agent::new("mailer", handler);
        let (bus, context) = shared_services();
        agent.attach(bus.clone(), context);

        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle { .. }));
        assert_eq!(agent.status(), AgentStatus::Error);
        assert_eq!(agent.health().error_count, 1);
        assert!(!bus.is_subscribed("mailer"));
    }

    #[tokio::test]
    async fn test_messages_flow_through_bus() {
        let (handler, seen) = Recorder::new();
        let agent = Agent::new("agent1", handler);
        let (bus, context) = shared_services();
        agent.attach(bus.clone(), context);
        agent.start().await.unwrap();

        assert!(bus.send(Message::new("x", "agent1", "ping", Payload::new())));
        assert!(bus.send(Message::new("x", "agent1", "pong", Payload::new())));
        eventually(|| agent.metrics().messages_processed == 2).await;

        assert_eq!(*seen.lock().unwrap(), vec!["ping", "pong"]);
        assert!(agent.metrics().last_activity.is_some());
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_contains_errors_and_panics() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("a", handler);

        let ok = agent.process(&Message::new("x", "a", "hello", Payload::new())).await;
        assert!(ok.success);
        assert_eq!(ok.data["echo"], "hello");

        let failed = agent.process(&Message::new("x", "a", "fail", Payload::new())).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("refused"));
        assert_eq!(failed.data["success"], false);

        let panicked = agent.process(&Message::new("x", "a", "panic", Payload::new())).await;
        assert!(!panicked.success);
        assert_eq!(panicked.error.as_deref(), Some("panicked: boom"));

        let health = agent.health();
        assert_eq!(health.metrics.messages_processed, 1);
        assert_eq!(health.metrics.messages_failed, 2);
        assert_eq!(health.error_count, 2);
    }

    #[tokio::test]
    async fn test_pause_defers_until_resume() {
        let (handler, seen) = Recorder::new();
        let agent = Agent::new("a", handler);
        let (bus, context) = shared_services();
        agent.attach(bus.clone(), context);
        agent.start().await.unwrap();

        agent.pause().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Paused);
        bus.send(Message::new("x", "a", "first", Payload::new()));
        bus.send(Message::builder("x", "a", "stale").ttl(1).build());
        bus.send(Message::new("x", "a", "second", Payload::new()));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(seen.lock().unwrap().is_empty());

        agent.resume().await.unwrap();
        eventually(|| seen.lock().unwrap().len() == 2).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        assert!(agent.resume().await.is_err());
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_observers_see_every_transition() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("a", handler);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        agent.add_status_observer(Arc::new(move |change: &StatusChange| {
            sink.lock().unwrap().push((change.from, change.to));
        }));

        agent.start().await.unwrap();
        agent.stop().await.unwrap();

        use AgentStatus::*;
        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                (Stopped, Starting),
                (Starting, Running),
                (Running, ShuttingDown),
                (ShuttingDown, Stopped)
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_from_error() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("a", handler);
        agent.start().await.unwrap();
        agent.report_error("lost connection").unwrap();
        assert_eq!(agent.status(), AgentStatus::Error);

        agent.start().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Running);
        assert!(agent.services().unwrap().bus().is_subscribed("a"));
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_through_context() {
        let (handler, _) = Recorder::new();
        let agent = Agent::new("oracle", handler);
        let (bus, context) = shared_services();
        agent.attach(bus.clone(), context);
        agent.start().await.unwrap();

        let reply = bus
            .send_with_reply(
                Message::new("client", "oracle", "ask", Payload::new()),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.message_type(), "answer");
        assert_eq!(reply.sender(), "oracle");
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_opt_out() {
        let calls = Arc::new(AtomicUsize::new(0));

        struct Count(Arc<AtomicUsize>);

        #[async_trait]
        impl MessageHandler for Count {
            async fn handle(&self, _message: &Message, _ctx: &AgentContext) -> anyhow::Result<Payload> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new())
            }
        }

        let (bus, context) = shared_services();
        let deaf = Agent::builder("deaf", Count(calls.clone()))
            .receives_broadcasts(false)
            .build();
        deaf.attach(bus.clone(), context);
        deaf.start().await.unwrap();

        assert!(!bus.broadcast(Message::broadcast("x", "news", Payload::new())));
        assert!(bus.send(Message::new("x", "deaf", "direct", Payload::new())));
        eventually(|| calls.load(Ordering::SeqCst) == 1).await;
        deaf.stop().await.unwrap();
    }
}
