//! Registered agents and the status table kept current by observers.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::agent::{Agent, AgentStatus, StatusChange, StatusObserver};
use crate::config::AgentConfig;

/// What the manager knows about one agent.
#[derive(Clone, Debug)]
pub(crate) struct AgentRecord {
    pub agent: Arc<Agent>,
    pub config: AgentConfig,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<String>,
    /// Registration sequence; fixes tie order when resolving startup order.
    seq: u64,
}

impl AgentRecord {
    /// Merge what the agent declares with what its configuration adds.
    pub fn new(agent: Arc<Agent>, config: AgentConfig) -> Self {
        let dependencies = merge(agent.dependencies(), &config.dependencies);
        let capabilities = merge(agent.capabilities(), &config.capabilities);
        Self {
            agent,
            config,
            dependencies,
            capabilities,
            seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        self.agent.id()
    }
}

fn merge(declared: &[String], configured: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(declared.len() + configured.len());
    for item in declared.iter().chain(configured) {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

#[derive(Default)]
pub(crate) struct Registry {
    records: DashMap<String, AgentRecord>,
    next_seq: AtomicU64,
}

impl Registry {
    /// Insert or replace. A replacement keeps the registration slot of the agent it replaces.
    pub fn insert(&self, mut record: AgentRecord) -> Option<AgentRecord> {
        let id = record.id().to_string();
        record.seq = match self.records.get(&id) {
            Some(existing) => existing.seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.records.insert(id, record)
    }

    pub fn remove(&self, id: &str) -> Option<AgentRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// All records in registration order.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.seq);
        records
    }
}

/// Last known status of every registered agent.
#[derive(Default)]
pub(crate) struct StatusTable {
    entries: DashMap<String, AgentStatus>,
}

impl StatusTable {
    pub fn track(&self, agent_id: &str, status: AgentStatus) {
        self.entries.insert(agent_id.to_string(), status);
    }

    pub fn forget(&self, agent_id: &str) {
        self.entries.remove(agent_id);
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentStatus> {
        self.entries.get(agent_id).map(|s| *s)
    }

    pub fn count(&self, status: AgentStatus) -> usize {
        self.entries.iter().filter(|s| *s.value() == status).count()
    }
}

impl StatusObserver for StatusTable {
    fn on_status_change(&self, change: &StatusChange) {
        // Only agents still registered are tracked.
        if let Some(mut status) = self.entries.get_mut(&change.agent_id) {
            *status = change.to;
            info!(
                "Agent {} status changed: {} -> {}",
                change.agent_id, change.from, change.to
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentContext, MessageHandler};
    use crate::protocol::{Message, Payload};
    use async_trait::async_trait;
    use chrono::Utc;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _message: &Message, _ctx: &AgentContext) -> anyhow::Result<Payload> {
            Ok(Payload::new())
        }
    }

    fn record(id: &str) -> AgentRecord {
        AgentRecord::new(Arc::new(Agent::new(id, Noop)), AgentConfig::default())
    }

    #[test]
    fn test_merge_declared_and_configured() {
        let agent = Agent::builder("email", Noop)
            .dependencies(["chat"])
            .capabilities(["compose"])
            .build();
        let config = AgentConfig::default()
            .with_dependencies(["chat", "context"])
            .with_capabilities(["send"]);
        let record = AgentRecord::new(Arc::new(agent), config);

        assert_eq!(record.dependencies, vec!["chat", "context"]);
        assert_eq!(record.capabilities, vec!["compose", "send"]);
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry = Registry::default();
        for id in ["b", "c", "a"] {
            registry.insert(record(id));
        }
        assert!(registry.insert(record("c")).is_some());

        let ids: Vec<String> = registry.snapshot().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        registry.remove("c");
        assert!(registry.get("c").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_status_table_ignores_untracked() {
        let table = StatusTable::default();
        table.track("a", AgentStatus::Stopped);

        let change = |id: &str| StatusChange {
            agent_id: id.to_string(),
            from: AgentStatus::Stopped,
            to: AgentStatus::Starting,
            at: Utc::now(),
        };
        table.on_status_change(&change("a"));
        table.on_status_change(&change("b"));

        assert_eq!(table.get("a"), Some(AgentStatus::Starting));
        assert_eq!(table.get("b"), None);
        assert_eq!(table.count(AgentStatus::Starting), 1);
    }
}
