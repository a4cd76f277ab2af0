//! Context items and the scopes that partition them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::protocol::{Payload, SYSTEM_SENDER};

/// Storage partition of the context store.
///
/// `Global` is one shared partition; the others are partitioned by owner id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "owner", rename_all = "lowercase")]
pub enum Scope {
    Global,
    Agent(String),
    Session(String),
    User(String),
}

impl Scope {
    pub fn agent(id: impl Into<String>) -> Self {
        Scope::Agent(id.into())
    }

    pub fn session(id: impl Into<String>) -> Self {
        Scope::Session(id.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Scope::User(id.into())
    }

    /// Owning identifier; global items are owned by the system.
    pub fn owner(&self) -> &str {
        match self {
            Scope::Global => SYSTEM_SENDER,
            Scope::Agent(id) | Scope::Session(id) | Scope::User(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Agent(_) => "agent",
            Scope::Session(_) => "session",
            Scope::User(_) => "user",
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Global
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            other => write!(f, "{}:{}", other.kind(), other.owner()),
        }
    }
}

/// Optional attributes for [`super::ContextStore::set_with`].
#[derive(Clone, Debug, Default)]
pub struct ItemOptions {
    /// Time to live in seconds, measured from the last update.
    pub ttl: Option<u64>,
    pub tags: BTreeSet<String>,
    pub metadata: Payload,
}

impl ItemOptions {
    pub fn ttl(seconds: u64) -> Self {
        Self {
            ttl: Some(seconds),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A stored value plus its bookkeeping.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContextItem {
    pub key: String,
    pub value: Value,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Payload,
}

impl ContextItem {
    pub fn new(key: impl Into<String>, value: Value, scope: Scope, options: ItemOptions) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            scope,
            created_at: now,
            updated_at: now,
            ttl: options.ttl,
            tags: options.tags,
            metadata: options.metadata,
        }
    }

    pub fn owner(&self) -> &str {
        self.scope.owner()
    }

    /// Check if the item's TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Absent once `now - updated_at > ttl`. A TTL too large to represent never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = self
            .ttl
            .and_then(|ttl| i64::try_from(ttl).ok())
            .and_then(Duration::try_seconds);
        match ttl {
            Some(ttl) => now - self.updated_at > ttl,
            None => false,
        }
    }

    pub fn has_tags<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        tags.into_iter().all(|t| self.tags.contains(t))
    }
}
