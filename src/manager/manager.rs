//! Agent manager: registration, dependency-ordered startup and shutdown,
//! restarts and the periodic health monitor.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::health::{assess, HealthReport};
use super::ordering::{resolve, StartupPlan};
use super::registry::{AgentRecord, Registry, StatusTable};
use crate::agent::{Agent, AgentStatus, HealthSnapshot};
use crate::bus::{BusStatistics, MessageBus};
use crate::config::{AgentConfig, ManagerConfig, RuntimeConfig};
use crate::context::{ContextStatistics, ContextStore};
use crate::error::{Error, Result};
use crate::protocol::{Message, Payload, SYSTEM_SENDER};

struct Monitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: ManagerConfig,
    /// Configurations from the runtime config, used by `register_default`.
    agent_configs: BTreeMap<String, AgentConfig>,
    bus: Arc<MessageBus>,
    context: Arc<ContextStore>,
    registry: Registry,
    statuses: Arc<StatusTable>,
    /// Plan computed by the last `start`.
    plan: RwLock<StartupPlan>,
    running: AtomicBool,
    restart_count: AtomicU64,
    failed_starts: AtomicU64,
    /// Consecutive failed restarts by the health monitor.
    restart_failures: DashMap<String, u32>,
    monitor: tokio::sync::Mutex<Option<Monitor>>,
}

/// Per-agent entry of [`FrameworkStatus`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AgentSummary {
    pub status: AgentStatus,
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub dependencies: Vec<String>,
}

/// Snapshot of the whole runtime.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FrameworkStatus {
    pub manager_status: String,
    pub total_agents: usize,
    pub running_agents: usize,
    pub stopped_agents: usize,
    pub error_agents: usize,
    pub failed_starts: u64,
    pub restart_count: u64,
    pub message_bus_stats: BusStatistics,
    pub context_stats: ContextStatistics,
    pub agents: BTreeMap<String, AgentSummary>,
}

/// Owns the agent registry and the shared bus and context store.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(config: ManagerConfig, bus: Arc<MessageBus>, context: Arc<ContextStore>) -> Self {
        Self::build(config, BTreeMap::new(), bus, context)
    }

    /// Build the bus, the context store and the manager from one configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::build(
            config.manager.clone(),
            config.agents.clone(),
            Arc::new(MessageBus::new(config.bus.clone())),
            Arc::new(ContextStore::new(config.context.clone())),
        )
    }

    pub fn with_defaults() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }

    fn build(
        config: ManagerConfig,
        agent_configs: BTreeMap<String, AgentConfig>,
        bus: Arc<MessageBus>,
        context: Arc<ContextStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                agent_configs,
                bus,
                context,
                registry: Registry::default(),
                statuses: Arc::new(StatusTable::default()),
                plan: RwLock::new(StartupPlan::default()),
                running: AtomicBool::new(false),
                restart_count: AtomicU64::new(0),
                failed_starts: AtomicU64::new(0),
                restart_failures: DashMap::new(),
                monitor: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.inner.context
    }

    /// Register an agent, wiring it to the shared bus and context store.
    ///
    /// An agent already registered under the same id is stopped and replaced.
    pub async fn register(&self, agent: Agent, config: AgentConfig) -> Arc<Agent> {
        let agent = Arc::new(agent);
        let agent_id = agent.id().to_string();
        agent.attach(self.inner.bus.clone(), self.inner.context.clone());
        agent.add_status_observer(self.inner.statuses.clone());

        let record = AgentRecord::new(agent.clone(), config);
        if let Some(previous) = self.inner.registry.insert(record) {
            warn!("Agent {} already registered, replacing it", agent_id);
            if let Err(e) = previous.agent.stop().await {
                warn!("Replaced agent {} did not stop cleanly: {}", agent_id, e);
            }
        }
        self.inner.statuses.track(&agent_id, agent.status());
        self.inner.restart_failures.remove(&agent_id);

        info!("Registered agent {}", agent_id);
        agent
    }

    /// Register with the configuration found under the agent's id in the
    /// runtime config, or the defaults.
    pub async fn register_default(&self, agent: Agent) -> Arc<Agent> {
        let config = self
            .inner
            .agent_configs
            .get(agent.id())
            .cloned()
            .unwrap_or_default();
        self.register(agent, config).await
    }

    /// Stop and remove an agent.
    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        let record = self.record(agent_id)?;
        if let Err(e) = record.agent.stop().await {
            warn!("Agent {} did not stop cleanly: {}", agent_id, e);
        }

        self.inner.registry.remove(agent_id);
        self.inner.statuses.forget(agent_id);
        self.inner.restart_failures.remove(agent_id);
        {
            let mut plan = self.inner.plan.write().unwrap_or_else(PoisonError::into_inner);
            plan.order.retain(|id| id != agent_id);
            plan.cyclic.retain(|id| id != agent_id);
        }

        info!("Unregistered agent {}", agent_id);
        Ok(())
    }

    /// Start shared services, then every enabled auto-start agent in
    /// dependency order, then the health monitor.
    ///
    /// Agents that fail to start are logged and counted; they do not fail the
    /// manager.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Agent manager already running");
            return Ok(());
        }
        info!("Starting agent manager");

        self.inner.bus.start().await;
        self.inner.context.start().await;

        let plan = self.resolve_startup_order();
        if plan.has_cycle() {
            error!("Dependency cycle among agents: {}", plan.cyclic.join(", "));
        }
        for (agent_id, dependency) in &plan.missing {
            warn!("Agent {} depends on unregistered agent {}", agent_id, dependency);
        }
        *self.inner.plan.write().unwrap_or_else(PoisonError::into_inner) = plan.clone();
        info!("Startup order: {}", plan.order.join(" -> "));

        let mut started = 0;
        for agent_id in &plan.order {
            let Some(record) = self.inner.registry.get(agent_id) else {
                continue;
            };
            if !record.config.enabled {
                debug!("Agent {} is disabled, not starting", agent_id);
                continue;
            }
            if !record.config.auto_start {
                debug!("Agent {} has auto_start off, not starting", agent_id);
                continue;
            }
            if record.agent.status().is_active() {
                debug!("Agent {} already running", agent_id);
                started += 1;
                continue;
            }

            let result = if plan.is_cyclic(agent_id) {
                self.inner.failed_starts.fetch_add(1, Ordering::Relaxed);
                Err(Error::DependencyCycle(agent_id.clone()))
            } else {
                self.start_record(&record).await
            };
            match result {
                Ok(()) => started += 1,
                Err(e) => error!("Failed to start agent {}: {}", agent_id, e),
            }
        }

        self.spawn_monitor().await;
        info!(
            "Agent manager started: {}/{} agents running",
            started,
            plan.order.len()
        );
        Ok(())
    }

    /// Stop the health monitor, every agent in reverse startup order, then
    /// the shared services.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            debug!("Agent manager not running");
            return Ok(());
        }
        info!("Stopping agent manager");
        self.stop_monitor().await;

        let order = self
            .inner
            .plan
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown_order();
        for agent_id in &order {
            if let Some(record) = self.inner.registry.get(agent_id) {
                if let Err(e) = record.agent.stop().await {
                    error!("Failed to stop agent {}: {}", agent_id, e);
                }
            }
        }
        // Agents registered after startup are not in the order.
        for record in self.inner.registry.snapshot() {
            if order.iter().any(|id| id == record.id()) {
                continue;
            }
            if let Err(e) = record.agent.stop().await {
                error!("Failed to stop agent {}: {}", record.id(), e);
            }
        }

        self.inner.context.stop().await;
        self.inner.bus.stop().await;
        info!("Agent manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start one agent once its dependencies are running.
    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        let record = self.record(agent_id)?;
        if !record.config.enabled {
            return Err(Error::AgentDisabled(agent_id.to_string()));
        }
        self.start_record(&record).await
    }

    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        self.record(agent_id)?.agent.stop().await
    }

    /// Stop, wait `restart_delay`, start. Counts a restart on success.
    ///
    /// An agent whose dependencies are not running is left untouched.
    pub async fn restart_agent(&self, agent_id: &str) -> Result<()> {
        let record = self.record(agent_id)?;
        if !record.config.enabled {
            return Err(Error::AgentDisabled(agent_id.to_string()));
        }
        // Leave the agent as it is when it could not come back anyway.
        if let Err(e) = self.check_dependencies(&record) {
            self.inner.failed_starts.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        info!("Restarting agent {}", agent_id);
        if let Err(e) = record.agent.stop().await {
            warn!("Agent {} did not stop cleanly: {}", agent_id, e);
        }

        tokio::time::sleep(self.inner.config.restart_delay).await;
        self.start_agent(agent_id).await?;

        self.inner.restart_count.fetch_add(1, Ordering::Relaxed);
        info!("Agent {} restarted", agent_id);
        Ok(())
    }

    async fn start_record(&self, record: &AgentRecord) -> Result<()> {
        let result = match self.check_dependencies(record) {
            Ok(()) => record.agent.start().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.inner.failed_starts.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn check_dependencies(&self, record: &AgentRecord) -> Result<()> {
        for dependency in &record.dependencies {
            let Some(target) = self.inner.registry.get(dependency) else {
                return Err(Error::DependencyNotRegistered {
                    agent: record.id().to_string(),
                    dependency: dependency.clone(),
                });
            };
            let status = target.agent.status();
            if status != AgentStatus::Running {
                return Err(Error::DependencyNotRunning {
                    agent: record.id().to_string(),
                    dependency: dependency.clone(),
                    status,
                });
            }
        }
        Ok(())
    }

    fn record(&self, agent_id: &str) -> Result<AgentRecord> {
        self.inner
            .registry
            .get(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    /// Order computed by the last `start`.
    pub fn startup_order(&self) -> Vec<String> {
        self.inner
            .plan
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    /// Resolve the startup order of the current registrations without
    /// starting anything.
    pub fn resolve_startup_order(&self) -> StartupPlan {
        let records = self.inner.registry.snapshot();
        resolve(records.iter().map(|r| (r.id(), r.dependencies.as_slice())))
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.inner.registry.get(agent_id).map(|r| r.agent)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|r| r.id().to_string())
            .collect()
    }

    pub fn agent_config(&self, agent_id: &str) -> Option<AgentConfig> {
        self.inner.registry.get(agent_id).map(|r| r.config)
    }

    /// Last status reported by the agent's observer.
    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.inner.statuses.get(agent_id)
    }

    pub fn agents_by_capability(&self, capability: &str) -> Vec<String> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .filter(|r| r.capabilities.iter().any(|c| c == capability))
            .map(|r| r.id().to_string())
            .collect()
    }

    pub fn dependencies(&self, agent_id: &str) -> Vec<String> {
        self.inner
            .registry
            .get(agent_id)
            .map(|r| r.dependencies)
            .unwrap_or_default()
    }

    /// Agents that declare a dependency on `agent_id`.
    pub fn dependents(&self, agent_id: &str) -> Vec<String> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .filter(|r| r.dependencies.iter().any(|d| d == agent_id))
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Send a message to one agent as the system sender.
    pub fn send_to(&self, agent_id: &str, message_type: &str, data: Payload) -> bool {
        self.send_as(SYSTEM_SENDER, agent_id, message_type, data)
    }

    pub fn send_as(&self, sender: &str, agent_id: &str, message_type: &str, data: Payload) -> bool {
        self.inner
            .bus
            .send(Message::new(sender, agent_id, message_type, data))
    }

    /// Broadcast a message as the system sender.
    pub fn broadcast(&self, message_type: &str, data: Payload) -> bool {
        self.broadcast_as(SYSTEM_SENDER, message_type, data)
    }

    pub fn broadcast_as(&self, sender: &str, message_type: &str, data: Payload) -> bool {
        self.inner
            .bus
            .broadcast(Message::broadcast(sender, message_type, data))
    }

    pub fn agent_metrics(&self, agent_id: &str) -> Option<HealthSnapshot> {
        self.inner.registry.get(agent_id).map(|r| r.agent.health())
    }

    pub fn all_agent_metrics(&self) -> BTreeMap<String, HealthSnapshot> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|r| (r.id().to_string(), r.agent.health()))
            .collect()
    }

    pub fn framework_status(&self) -> FrameworkStatus {
        let records = self.inner.registry.snapshot();
        let total_agents = self.inner.registry.len();
        let running_agents = self.inner.statuses.count(AgentStatus::Running);
        let error_agents = self.inner.statuses.count(AgentStatus::Error);

        let agents = records
            .iter()
            .map(|r| {
                let summary = AgentSummary {
                    status: self
                        .inner
                        .statuses
                        .get(r.id())
                        .unwrap_or_else(|| r.agent.status()),
                    enabled: r.config.enabled,
                    capabilities: r.capabilities.clone(),
                    dependencies: r.dependencies.clone(),
                };
                (r.id().to_string(), summary)
            })
            .collect();

        let manager_status = if self.is_running() { "running" } else { "stopped" };
        FrameworkStatus {
            manager_status: manager_status.to_string(),
            total_agents,
            running_agents,
            stopped_agents: total_agents.saturating_sub(running_agents + error_agents),
            error_agents,
            failed_starts: self.inner.failed_starts.load(Ordering::Relaxed),
            restart_count: self.inner.restart_count.load(Ordering::Relaxed),
            message_bus_stats: self.inner.bus.statistics(),
            context_stats: self.inner.context.statistics(),
            agents,
        }
    }

    /// One health monitor pass: restart agents in error and stalled agents.
    ///
    /// A failed restart is logged and retried on the next pass.
    pub async fn check_health(&self) -> HealthReport {
        let now = Utc::now();
        let mut report = HealthReport::default();

        for record in self.inner.registry.snapshot() {
            report.checked += 1;
            let agent_id = record.id().to_string();
            let Some(reason) = assess(&record.agent.health(), &record.config, now) else {
                continue;
            };

            warn!("Restarting agent {}: {}", agent_id, reason);
            match self.restart_agent(&agent_id).await {
                Ok(()) => {
                    self.inner.restart_failures.remove(&agent_id);
                    report.restarted.push(agent_id);
                }
                Err(e) => {
                    let failures = {
                        let mut count = self.inner.restart_failures.entry(agent_id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if failures > record.config.max_retries {
                        error!(
                            "Agent {} failed to restart {} times in a row (max_retries {}): {}",
                            agent_id, failures, record.config.max_retries, e
                        );
                    } else {
                        warn!("Failed to restart agent {}: {}", agent_id, e);
                    }
                    report.failed.push(agent_id);
                }
            }
        }
        report
    }

    /// Consecutive failed monitor restarts of an agent.
    pub fn restart_failures(&self, agent_id: &str) -> u32 {
        self.inner
            .restart_failures
            .get(agent_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    async fn spawn_monitor(&self) {
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(health_monitor(
            Arc::downgrade(&self.inner),
            self.inner.config.health_check_interval,
            shutdown_rx,
        ));
        *monitor = Some(Monitor { shutdown, task });
    }

    async fn stop_monitor(&self) {
        let monitor = self.inner.monitor.lock().await.take();
        let Some(monitor) = monitor else {
            return;
        };
        let _ = monitor.shutdown.send(true);
        if let Err(e) = monitor.task.await {
            error!("Health monitor ended abnormally: {}", e);
        }
    }
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("agents", &self.agent_ids())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Periodic health check. Holds the manager weakly so a dropped manager ends it.
async fn health_monitor(
    inner: Weak<ManagerInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(manager) = inner.upgrade().map(|inner| AgentManager { inner }) else {
            break;
        };
        let report = manager.check_health().await;
        if !report.restarted.is_empty() || !report.failed.is_empty() {
            info!(
                "Health check: {} checked, restarted [{}], failed [{}]",
                report.checked,
                report.restarted.join(", "),
                report.failed.join(", ")
            );
        }
    }
    debug!("Health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentContext, MessageHandler, StatusChange};
    use crate::protocol::payload;
    use crate::test_util::eventually;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counter {
        async fn handle(&self, message: &Message, _ctx: &AgentContext) -> anyhow::Result<Payload> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(payload([("echo", message.message_type().into())]))
        }
    }

    fn counter() -> (Counter, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Counter(calls.clone()), calls)
    }

    fn agent(id: &str, dependencies: &[&str]) -> Agent {
        let (handler, _) = counter();
        Agent::builder(id, handler)
            .dependencies(dependencies.iter().copied())
            .build()
    }

    fn fast_manager() -> AgentManager {
        let config = ManagerConfig::default().with_restart_delay(Duration::from_millis(10));
        AgentManager::new(
            config,
            Arc::new(MessageBus::default()),
            Arc::new(ContextStore::default()),
        )
    }

    #[tokio::test]
    async fn test_start_and_stop_follow_dependencies() {
        crate::logging::init_test();
        let manager = AgentManager::with_defaults();
        let b = manager.register(agent("B", &["A"]), AgentConfig::default()).await;
        let a = manager.register(agent("A", &[]), AgentConfig::default()).await;

        let stopped = Arc::new(Mutex::new(Vec::new()));
        for registered in [&a, &b] {
            let sink = stopped.clone();
            registered.add_status_observer(Arc::new(move |change: &StatusChange| {
                if change.to == AgentStatus::Stopped {
                    sink.lock().unwrap().push(change.agent_id.clone());
                }
            }));
        }

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.startup_order(), vec!["A", "B"]);
        assert_eq!(manager.agent_status("A"), Some(AgentStatus::Running));
        assert_eq!(manager.agent_status("B"), Some(AgentStatus::Running));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(*stopped.lock().unwrap(), vec!["B", "A"]);
        assert_eq!(manager.agent_status("A"), Some(AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn test_start_skips_running_agent() {
        let manager = AgentManager::with_defaults();
        manager.register(agent("a", &[]), AgentConfig::default()).await;
        let b = manager.register(agent("b", &["a"]), AgentConfig::default()).await;

        manager.start_agent("a").await.unwrap();
        manager.start_agent("b").await.unwrap();
        b.pause().await.unwrap();
        manager.start().await.unwrap();

        let status = manager.framework_status();
        assert_eq!(status.failed_starts, 0);
        assert_eq!(status.running_agents, 1);
        assert_eq!(manager.agent_status("a"), Some(AgentStatus::Running));
        assert_eq!(manager.agent_status("b"), Some(AgentStatus::Paused));

        manager.stop().await.unwrap();
        assert_eq!(manager.agent_status("b"), Some(AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn test_cycle_degrades_without_hanging() {
        let manager = AgentManager::with_defaults();
        manager.register(agent("x", &["y"]), AgentConfig::default()).await;
        manager.register(agent("y", &["x"]), AgentConfig::default()).await;
        manager.register(agent("z", &[]), AgentConfig::default()).await;

        manager.start().await.unwrap();

        assert_eq!(manager.startup_order(), vec!["z", "x", "y"]);
        assert_eq!(manager.agent_status("z"), Some(AgentStatus::Running));
        assert_ne!(manager.agent_status("x"), Some(AgentStatus::Running));
        assert_ne!(manager.agent_status("y"), Some(AgentStatus::Running));
        assert_eq!(manager.framework_status().failed_starts, 2);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_dependency_blocks_start() {
        let manager = AgentManager::with_defaults();
        manager.register(agent("a", &["ghost"]), AgentConfig::default()).await;
        manager.register(agent("b", &["a"]), AgentConfig::default()).await;

        let plan = manager.resolve_startup_order();
        assert_eq!(plan.missing, vec![("a".to_string(), "ghost".to_string())]);

        manager.start().await.unwrap();
        assert_eq!(manager.agent_status("a"), Some(AgentStatus::Stopped));
        assert_eq!(manager.agent_status("b"), Some(AgentStatus::Stopped));
        assert_eq!(manager.framework_status().failed_starts, 2);

        let err = manager.start_agent("a").await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotRegistered { .. }));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_start_off_and_disabled() {
        let manager = AgentManager::with_defaults();
        manager
            .register(agent("base", &[]), AgentConfig::default().with_auto_start(false))
            .await;
        manager.register(agent("top", &["base"]), AgentConfig::default()).await;
        let disabled = AgentConfig {
            enabled: false,
            ..AgentConfig::default()
        };
        manager.register(agent("off", &[]), disabled).await;

        manager.start().await.unwrap();
        assert_eq!(manager.agent_status("base"), Some(AgentStatus::Stopped));
        assert_eq!(manager.agent_status("off"), Some(AgentStatus::Stopped));
        let err = manager.start_agent("top").await.unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyNotRunning {
                status: AgentStatus::Stopped,
                ..
            }
        ));

        manager.start_agent("base").await.unwrap();
        manager.start_agent("top").await.unwrap();
        assert_eq!(manager.agent_status("top"), Some(AgentStatus::Running));

        let err = manager.start_agent("off").await.unwrap_err();
        assert!(matches!(err, Error::AgentDisabled(_)));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_counts_once() {
        let manager = fast_manager();
        manager.register(agent("a", &[]), AgentConfig::default()).await;
        manager.start().await.unwrap();

        manager.restart_agent("a").await.unwrap();
        assert_eq!(manager.agent_status("a"), Some(AgentStatus::Running));
        assert_eq!(manager.framework_status().restart_count, 1);

        assert!(matches!(
            manager.restart_agent("nobody").await.unwrap_err(),
            Error::AgentNotFound(_)
        ));
        assert_eq!(manager.framework_status().restart_count, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_monitor_restarts_error_agent() {
        crate::logging::init_test();
        let config = ManagerConfig::default()
            .with_health_check_interval(Duration::from_millis(50))
            .with_restart_delay(Duration::from_millis(10));
        let manager = AgentManager::new(
            config,
            Arc::new(MessageBus::default()),
            Arc::new(ContextStore::default()),
        );
        let a = manager.register(agent("a", &[]), AgentConfig::default()).await;
        manager.start().await.unwrap();

        a.report_error("socket closed").unwrap();
        assert_eq!(manager.agent_status("a"), Some(AgentStatus::Error));

        eventually(|| {
            manager.agent_status("a") == Some(AgentStatus::Running)
                && manager.framework_status().restart_count == 1
        })
        .await;
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_agent_restarted_once_active() {
        let manager = fast_manager();
        let config = AgentConfig::default().with_max_idle_time(Duration::from_millis(50));
        let a = manager.register(agent("a", &[]), config).await;
        manager.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Never active since start: exempt.
        assert!(manager.check_health().await.restarted.is_empty());

        assert!(manager.send_to("a", "ping", Payload::new()));
        eventually(|| a.metrics().messages_processed == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = manager.check_health().await;
        assert_eq!(report.restarted, vec!["a"]);
        assert_eq!(report.checked, 1);
        assert!(manager.check_health().await.restarted.is_empty());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_restarts_are_counted() {
        let manager = fast_manager();
        let b = manager.register(agent("b", &["a"]), AgentConfig::default()).await;
        manager.register(agent("a", &[]), AgentConfig::default()).await;
        manager.start().await.unwrap();

        manager.stop_agent("a").await.unwrap();
        b.report_error("upstream gone").unwrap();

        let report = manager.check_health().await;
        assert_eq!(report.failed, vec!["b"]);
        assert_eq!(manager.restart_failures("b"), 1);

        manager.start_agent("a").await.unwrap();
        let report = manager.check_health().await;
        assert_eq!(report.restarted, vec!["b"]);
        assert_eq!(manager.restart_failures("b"), 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let manager = AgentManager::with_defaults();
        let (first, first_calls) = counter();
        let (second, second_calls) = counter();
        manager.register(Agent::new("first", first), AgentConfig::default()).await;
        manager.register(Agent::new("second", second), AgentConfig::default()).await;
        manager.start().await.unwrap();

        assert!(manager.send_to("first", "ping", Payload::new()));
        assert!(!manager.send_to("missing", "ping", Payload::new()));
        assert!(manager.broadcast("news", Payload::new()));

        eventually(|| {
            first_calls.load(Ordering::SeqCst) == 2 && second_calls.load(Ordering::SeqCst) == 1
        })
        .await;
        assert_eq!(manager.bus().dead_letters().len(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_stops_agent() {
        let manager = AgentManager::with_defaults();
        let a = manager.register(agent("a", &[]), AgentConfig::default()).await;
        manager.start().await.unwrap();

        manager.unregister("a").await.unwrap();
        assert_eq!(a.status(), AgentStatus::Stopped);
        assert!(manager.agent("a").is_none());
        assert!(manager.agent_status("a").is_none());
        assert!(!manager.bus().is_subscribed("a"));
        assert!(manager.startup_order().is_empty());

        assert!(matches!(
            manager.unregister("a").await.unwrap_err(),
            Error::AgentNotFound(_)
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_replaces_running_agent() {
        let manager = AgentManager::with_defaults();
        let old = manager.register(agent("a", &[]), AgentConfig::default()).await;
        manager.start_agent("a").await.unwrap();

        let new = manager.register(agent("a", &[]), AgentConfig::default()).await;
        assert_eq!(old.status(), AgentStatus::Stopped);
        assert_eq!(new.status(), AgentStatus::Stopped);
        assert_eq!(manager.agent_ids(), vec!["a"]);
        assert_eq!(manager.agent_status("a"), Some(AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn test_register_default_uses_runtime_config() {
        let mut runtime = RuntimeConfig::default();
        runtime.agents.insert(
            "mailer".to_string(),
            AgentConfig::default()
                .with_auto_start(false)
                .with_capabilities(["email"]),
        );
        let manager = AgentManager::from_config(&runtime);
        manager.register_default(agent("mailer", &[])).await;

        let config = manager.agent_config("mailer").unwrap();
        assert!(!config.auto_start);
        assert_eq!(manager.agents_by_capability("email"), vec!["mailer"]);
    }

    #[tokio::test]
    async fn test_queries_and_framework_status() {
        let manager = AgentManager::with_defaults();
        let (handler, _) = counter();
        manager
            .register(
                Agent::builder("chat", handler)
                    .capabilities(["conversation"])
                    .build(),
                AgentConfig::default(),
            )
            .await;
        manager
            .register(
                agent("email", &["chat"]),
                AgentConfig::default().with_capabilities(["email", "conversation"]),
            )
            .await;
        let broken = manager.register(agent("calendar", &["email"]), AgentConfig::default()).await;
        manager.start().await.unwrap();
        broken.report_error("quota exceeded").unwrap();

        assert_eq!(manager.agents_by_capability("conversation"), vec!["chat", "email"]);
        assert_eq!(manager.dependencies("calendar"), vec!["email"]);
        assert_eq!(manager.dependents("chat"), vec!["email"]);
        assert!(manager.dependencies("nobody").is_empty());

        let status = manager.framework_status();
        assert_eq!(status.manager_status, "running");
        assert_eq!(status.total_agents, 3);
        assert_eq!(status.running_agents, 2);
        assert_eq!(status.error_agents, 1);
        assert_eq!(status.stopped_agents, 0);
        assert_eq!(status.agents["calendar"].status, AgentStatus::Error);
        assert_eq!(status.agents["email"].dependencies, vec!["chat"]);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["agents"]["chat"]["status"], "running");
        assert_eq!(manager.all_agent_metrics().len(), 3);
        assert_eq!(
            manager.agent_metrics("calendar").unwrap().status,
            AgentStatus::Error
        );

        manager.stop().await.unwrap();
        let status = manager.framework_status();
        assert_eq!(status.manager_status, "stopped");
        assert_eq!(status.running_agents, 0);
    }
}
