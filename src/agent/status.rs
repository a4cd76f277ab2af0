//! Agent status state machine and status-change observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Paused,
    Error,
    ShuttingDown,
}

impl AgentStatus {
    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Paused)
                | (Running, Error)
                | (Running, ShuttingDown)
                | (Paused, Running)
                | (Paused, Error)
                | (Paused, ShuttingDown)
                | (Error, ShuttingDown)
                | (Error, Starting)
                | (ShuttingDown, Stopped)
                | (ShuttingDown, Error)
        )
    }

    /// Running or paused: subscribed and holding a processing loop.
    pub fn is_active(self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Paused)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Stopped => write!(f, "stopped"),
            AgentStatus::Starting => write!(f, "starting"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Paused => write!(f, "paused"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// One accepted status transition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusChange {
    pub agent_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
}

/// Notified synchronously, in registration order, after every transition.
///
/// Implementations must not block or call back into the agent's lifecycle.
pub trait StatusObserver: Send + Sync {
    fn on_status_change(&self, change: &StatusChange);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusChange) + Send + Sync,
{
    fn on_status_change(&self, change: &StatusChange) {
        self(change)
    }
}
