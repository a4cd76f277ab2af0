//! Agentry library root.
//!
//! An in-process runtime for message-driven agents: a message bus with
//! dead-lettering and request/reply, an agent lifecycle state machine, a
//! manager that starts agents in dependency order and restarts unhealthy
//! ones, and a scoped context store with expiry.

pub mod agent;
pub mod bus;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;

#[cfg(test)]
mod test_util;

pub use agent::{Agent, AgentContext, AgentStatus, MessageHandler};
pub use bus::MessageBus;
pub use cli::Commands;
pub use config::{load_config, RuntimeConfig};
pub use context::{ContextStore, Scope};
pub use error::{Error, Result};
pub use manager::AgentManager;
pub use protocol::{Message, Payload, Priority};
