//! Health assessment for the periodic monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::agent::{AgentStatus, HealthSnapshot};
use crate::config::AgentConfig;

/// Why the monitor wants an agent restarted.
#[derive(Clone, Debug, PartialEq)]
pub enum RestartReason {
    ErrorState,
    Idle(Duration),
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::ErrorState => write!(f, "agent is in error state"),
            RestartReason::Idle(idle) => write!(f, "agent idle for {}s", idle.as_secs()),
        }
    }
}

/// Decide whether an agent needs a restart.
///
/// Only agents with auto-restart enabled are considered. An agent in error is
/// restarted; a running agent is restarted once it has been idle longer than
/// its `max_idle_time`. Idle time only counts after the first message handled
/// since the agent's latest start.
pub fn assess(health: &HealthSnapshot, config: &AgentConfig, now: DateTime<Utc>) -> Option<RestartReason> {
    if !config.enabled || !config.auto_restart {
        return None;
    }

    match health.status {
        AgentStatus::Error => Some(RestartReason::ErrorState),
        AgentStatus::Running => {
            let idle = health.idle_for(now)?.to_std().ok()?;
            (idle > config.max_idle_time).then_some(RestartReason::Idle(idle))
        }
        _ => None,
    }
}

/// Outcome of one monitor pass.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HealthReport {
    pub checked: usize,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentMetrics;
    use chrono::Duration as ChronoDuration;

    fn health(status: AgentStatus, idle_secs: Option<i64>) -> HealthSnapshot {
        let now = Utc::now();
        HealthSnapshot {
            agent_id: "a".to_string(),
            status,
            started_at: Some(now - ChronoDuration::seconds(3600)),
            uptime: 3600.0,
            error_count: 0,
            capabilities: Vec::new(),
            metrics: AgentMetrics {
                last_activity: idle_secs.map(|s| now - ChronoDuration::seconds(s)),
                ..AgentMetrics::default()
            },
        }
    }

    #[test]
    fn test_error_state_restarts() {
        let config = AgentConfig::default();
        assert_eq!(
            assess(&health(AgentStatus::Error, None), &config, Utc::now()),
            Some(RestartReason::ErrorState)
        );
        assert_eq!(assess(&health(AgentStatus::Stopped, None), &config, Utc::now()), None);
    }

    #[test]
    fn test_idle_threshold() {
        let config = AgentConfig::default().with_max_idle_time(Duration::from_secs(300));

        assert_eq!(assess(&health(AgentStatus::Running, Some(100)), &config, Utc::now()), None);
        assert_eq!(assess(&health(AgentStatus::Running, None), &config, Utc::now()), None);
        assert!(matches!(
            assess(&health(AgentStatus::Running, Some(400)), &config, Utc::now()),
            Some(RestartReason::Idle(_))
        ));
        // Paused agents are idle on purpose.
        assert_eq!(assess(&health(AgentStatus::Paused, Some(400)), &config, Utc::now()), None);
    }

    #[test]
    fn test_auto_restart_disabled() {
        let config = AgentConfig::default().with_auto_restart(false);
        assert_eq!(assess(&health(AgentStatus::Error, None), &config, Utc::now()), None);
    }
}
