//! Message envelopes exchanged between agents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Payload, Priority, BROADCAST};

/// Immutable unit of communication routed by the bus.
///
/// Fields are read through accessors; a message never changes after it has
/// been built. Deriving a variant (for example attaching a correlation id)
/// produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    sender: String,
    recipient: String,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    data: Payload,
    #[serde(default)]
    priority: Priority,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
    /// Time to live in seconds.
    #[serde(default)]
    ttl: Option<u64>,
}

impl Message {
    /// Direct message with a fresh id and the current timestamp.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        data: Payload,
    ) -> Self {
        Self::builder(sender, recipient, message_type).data(data).build()
    }

    /// Message addressed to every broadcast subscriber.
    pub fn broadcast(sender: impl Into<String>, message_type: impl Into<String>, data: Payload) -> Self {
        Self::new(sender, BROADCAST, message_type, data)
    }

    /// Start building a message.
    pub fn builder(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
    ) -> MessageBuilder {
        MessageBuilder::new(sender, recipient, message_type)
    }

    /// Reply to `request`: addressed to its sender, carrying its correlation id.
    pub fn reply(
        request: &Message,
        sender: impl Into<String>,
        message_type: impl Into<String>,
        data: Payload,
    ) -> Self {
        let mut builder = Self::builder(sender, request.sender.clone(), message_type)
            .data(data)
            .priority(request.priority)
            .reply_to(request.id.clone());
        if let Some(correlation_id) = &request.correlation_id {
            builder = builder.correlation_id(correlation_id.clone());
        }
        builder.build()
    }

    /// Copy of this message carrying `correlation_id`.
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }

    /// Time elapsed since the message was created.
    pub fn age(&self) -> Duration {
        Utc::now() - self.timestamp
    }

    /// Check if the message's TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expired once `now - timestamp >= ttl`, so a TTL of zero is always expired.
    /// A TTL too large to represent never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = self
            .ttl
            .and_then(|ttl| i64::try_from(ttl).ok())
            .and_then(Duration::try_seconds);
        match ttl {
            Some(ttl) => now - self.timestamp >= ttl,
            None => false,
        }
    }
}

/// Builder for creating messages with a fluent API.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    id: Option<String>,
    sender: String,
    recipient: String,
    message_type: String,
    data: Payload,
    priority: Priority,
    timestamp: Option<DateTime<Utc>>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    ttl: Option<u64>,
}

impl MessageBuilder {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            data: Payload::new(),
            priority: Priority::Normal,
            timestamp: None,
            correlation_id: None,
            reply_to: None,
            ttl: None,
        }
    }

    /// Use an explicit id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn data(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    /// Insert a single payload entry.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the creation timestamp.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to = Some(id.into());
        self
    }

    /// Time to live in seconds.
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: self.id.unwrap_or_else(generate_id),
            sender: self.sender,
            recipient: self.recipient,
            message_type: self.message_type,
            data: self.data,
            priority: self.priority,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            ttl: self.ttl,
        }
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::payload;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("x", "agent1", "ping", Payload::new());

        assert_eq!(msg.sender(), "x");
        assert_eq!(msg.recipient(), "agent1");
        assert_eq!(msg.message_type(), "ping");
        assert_eq!(msg.priority(), Priority::Normal);
        assert!(!msg.id().is_empty());
        assert!(msg.correlation_id().is_none());
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_builder_explicit_fields() {
        let msg = Message::builder("x", "agent1", "ping")
            .id("m1")
            .field("n", 1)
            .priority(Priority::High)
            .ttl(60)
            .build();

        assert_eq!(msg.id(), "m1");
        assert_eq!(msg.data()["n"], 1);
        assert_eq!(msg.priority(), Priority::High);
        assert_eq!(msg.ttl(), Some(60));
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        for ttl in [u64::MAX, u64::MAX / 2, 10_000_000_000_000_000, i64::MAX as u64 / 1000 + 1] {
            let msg = Message::builder("x", "agent1", "ping").ttl(ttl).build();
            assert!(!msg.is_expired(), "ttl {}", ttl);
            assert!(!msg.is_expired_at(Utc::now() + Duration::days(365)));
        }
    }

    #[test]
    fn test_zero_ttl_is_already_expired() {
        let msg = Message::builder("x", "agent1", "ping").ttl(0).build();
        assert!(msg.is_expired());
    }

    #[test]
    fn test_backdated_message_expires() {
        let msg = Message::builder("x", "agent1", "ping")
            .timestamp(Utc::now() - Duration::seconds(10))
            .ttl(5)
            .build();
        assert!(msg.is_expired());

        let fresh = Message::builder("x", "agent1", "ping")
            .timestamp(Utc::now() - Duration::seconds(10))
            .ttl(30)
            .build();
        assert!(!fresh.is_expired());
    }

    #[test]
    fn test_reply_pairs_with_request() {
        let request = Message::builder("client", "weather", "forecast")
            .correlation_id("c-1")
            .build();
        let reply = Message::reply(&request, "weather", "forecast_result", payload([("temp", 21.into())]));

        assert_eq!(reply.recipient(), "client");
        assert_eq!(reply.sender(), "weather");
        assert_eq!(reply.correlation_id(), Some("c-1"));
        assert_eq!(reply.reply_to(), Some(request.id()));
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::builder("x", "*", "announce").id("m9").build();
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "announce");
        assert_eq!(value["recipient"], "*");
        assert_eq!(value["priority"], "normal");
        assert!(value.get("correlation_id").is_some());

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert!(back.is_broadcast());
    }
}
