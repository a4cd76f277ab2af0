//! In-process message bus: per-agent queues, broadcast, request/reply and
//! a dead letter queue.

pub mod dead_letter;
pub mod message_bus;
pub mod stats;
pub mod subscriber;

pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use message_bus::MessageBus;
pub use stats::BusStatistics;
pub use subscriber::{subscriber_fn, FnSubscriber, Subscriber};
