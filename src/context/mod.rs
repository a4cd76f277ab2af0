//! Shared context store.

pub mod item;
pub mod store;

pub use item::{ContextItem, ItemOptions, Scope};
pub use store::{ContextEvent, ContextSnapshot, ContextStatistics, ContextStore};
