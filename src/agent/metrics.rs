//! Per-agent processing metrics and the health snapshot.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::status::AgentStatus;
use crate::protocol::Payload;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AgentMetrics {
    pub messages_processed: u64,
    pub messages_failed: u64,
    /// Mean handling time of successful messages, in seconds.
    pub average_processing_time: f64,
    pub total_processing_time: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_activity = Some(at);
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.messages_processed += 1;
        self.total_processing_time += elapsed.as_secs_f64();
        self.average_processing_time = self.total_processing_time / self.messages_processed as f64;
    }

    pub(crate) fn record_failure(&mut self) {
        self.messages_failed += 1;
    }
}

/// Result of one [`super::Agent::process`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessOutcome {
    pub message_id: String,
    pub success: bool,
    pub data: Payload,
    pub error: Option<String>,
    pub processing_time: Duration,
}

/// Observable state of an agent; the health monitor's only input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthSnapshot {
    pub agent_id: String,
    pub status: AgentStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since the most recent start; zero when never started.
    pub uptime: f64,
    pub error_count: u64,
    pub capabilities: Vec<String>,
    pub metrics: AgentMetrics,
}

impl HealthSnapshot {
    /// Time since the last activity, counted only once the agent has handled
    /// a message since its most recent start.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        let started_at = self.started_at?;
        let last = self.metrics.last_activity?;
        (last >= started_at).then(|| now - last)
    }
}
