//! Agents: the status state machine, the handling contract and the runtime
//! that drives a handler from its bus subscription.

pub mod handler;
pub mod metrics;
pub mod runtime;
pub mod status;

pub use handler::{AgentContext, MessageHandler};
pub use metrics::{AgentMetrics, HealthSnapshot, ProcessOutcome};
pub use runtime::{Agent, AgentBuilder};
pub use status::{AgentStatus, StatusChange, StatusObserver};
