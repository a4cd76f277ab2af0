//! Message protocol shared by the bus, agents and the manager.
//!
//! There is no wire transport: the envelope schema defined here is the
//! in-memory contract, kept serde-serializable field-for-field so a remote
//! transport can be layered on later.

pub mod envelope;
pub mod types;

pub use envelope::{Message, MessageBuilder};
pub use types::{payload, Payload, Priority, BROADCAST, SYSTEM_SENDER};
