//! Agent manager: owns the registry, starts agents in dependency order and
//! watches their health.

pub mod health;
#[allow(clippy::module_inception)]
pub mod manager;
pub mod ordering;
mod registry;

pub use health::{assess, HealthReport, RestartReason};
pub use manager::{AgentManager, AgentSummary, FrameworkStatus};
pub use ordering::{resolve, StartupPlan};
