//! Shared message vocabulary: priorities, payloads and well-known ids.

use serde::{Deserialize, Serialize};

/// Recipient wildcard addressing every broadcast subscriber.
pub const BROADCAST: &str = "*";

/// Sender id used by the manager and other non-agent callers.
pub const SYSTEM_SENDER: &str = "system";

/// Free-form key/value payload carried by every message.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Message priority levels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Build a payload from `(key, value)` pairs.
///
/// ```
/// use agentry::protocol::payload;
/// let data = payload([("city", "Oslo".into()), ("days", 3.into())]);
/// assert_eq!(data["days"], 3);
/// ```
pub fn payload<K, I>(entries: I) -> Payload
where
    K: Into<String>,
    I: IntoIterator<Item = (K, serde_json::Value)>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_serializes_lowercase() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }
}
