//! Error types for agentry.

use thiserror::Error;

use crate::agent::AgentStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        agent: String,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("Agent {agent} lifecycle failure: {reason}")]
    Lifecycle { agent: String, reason: String },

    #[error("Agent {agent} depends on {dependency}, which is not registered")]
    DependencyNotRegistered { agent: String, dependency: String },

    #[error("Agent {agent} depends on {dependency}, which is not running (status: {status})")]
    DependencyNotRunning {
        agent: String,
        dependency: String,
        status: AgentStatus,
    },

    #[error("Agent {0} is part of a dependency cycle")]
    DependencyCycle(String),

    #[error("Agent {0} is disabled")]
    AgentDisabled(String),
}

impl Error {
    pub(crate) fn lifecycle(agent: &str, reason: impl Into<String>) -> Self {
        Error::Lifecycle {
            agent: agent.to_string(),
            reason: reason.into(),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
