//! Scoped, TTL-bearing key/value store shared by agents and the manager.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::item::{ContextItem, ItemOptions, Scope};
use crate::config::ContextConfig;
use crate::error::Result;
use crate::protocol::Payload;

/// Change notification published to [`ContextStore::subscribe`] receivers.
#[derive(Clone, Debug, PartialEq)]
pub enum ContextEvent {
    Set { scope: Scope, key: String },
    Updated { scope: Scope, key: String },
    Deleted { scope: Scope, key: String },
    Expired { scope: Scope, key: String },
    Cleared { scope: Scope, removed: usize },
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContextStatistics {
    /// Live (unexpired) items across all partitions.
    pub total_items: usize,
    /// Items removed by cleanup since the store was created.
    pub expired_items: u64,
    pub update_count: u64,
    pub global_items: usize,
    pub agent_partitions: usize,
    pub session_partitions: usize,
    pub user_partitions: usize,
}

/// Serializable copy of every live item.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContextSnapshot {
    pub exported_at: DateTime<Utc>,
    pub items: Vec<ContextItem>,
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Context store.
///
/// Each scope owns its own partition; partitions are locked independently.
/// Every read path checks expiry itself, so the periodic sweep only reclaims
/// memory.
pub struct ContextStore {
    partitions: DashMap<Scope, HashMap<String, ContextItem>>,
    events: broadcast::Sender<ContextEvent>,
    expired_count: AtomicU64,
    update_count: AtomicU64,
    config: ContextConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl ContextStore {
    pub fn new(config: ContextConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            partitions: DashMap::new(),
            events,
            expired_count: AtomicU64::new(0),
            update_count: AtomicU64::new(0),
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Receive change events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ContextEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Store `value` under `key`, replacing any previous item.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>, scope: Scope) {
        self.set_with(key, value, scope, ItemOptions::default());
    }

    /// Store `value` with a TTL, tags or metadata.
    pub fn set_with(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        scope: Scope,
        options: ItemOptions,
    ) {
        let key = key.into();
        let item = ContextItem::new(key.clone(), value.into(), scope.clone(), options);
        self.partitions
            .entry(scope.clone())
            .or_default()
            .insert(key.clone(), item);

        debug!("Context set {} in {}", key, scope);
        self.emit(ContextEvent::Set { scope, key });
    }

    /// Live item under `key`, with its metadata.
    pub fn get_item(&self, key: &str, scope: &Scope) -> Option<ContextItem> {
        let partition = self.partitions.get(scope)?;
        let item = partition.get(key).filter(|item| !item.is_expired()).cloned();
        item
    }

    /// Value under `key`; expired items read as missing.
    pub fn get(&self, key: &str, scope: &Scope) -> Option<Value> {
        self.get_item(key, scope).map(|item| item.value)
    }

    pub fn get_or(&self, key: &str, scope: &Scope, default: impl Into<Value>) -> Value {
        self.get(key, scope).unwrap_or_else(|| default.into())
    }

    /// Typed read. A missing key is `Ok(None)`; a value of the wrong shape is an error.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str, scope: &Scope) -> Result<Option<T>> {
        match self.get(key, scope) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Replace the value of a live item, merging `metadata` into its own.
    ///
    /// Returns false if the item is missing or expired.
    pub fn update(
        &self,
        key: &str,
        scope: &Scope,
        value: impl Into<Value>,
        metadata: Option<Payload>,
    ) -> bool {
        {
            let Some(mut partition) = self.partitions.get_mut(scope) else {
                return false;
            };
            let Some(item) = partition.get_mut(key).filter(|item| !item.is_expired()) else {
                return false;
            };

            item.value = value.into();
            item.updated_at = Utc::now();
            if let Some(metadata) = metadata {
                item.metadata.extend(metadata);
            }
        }

        self.update_count.fetch_add(1, Ordering::Relaxed);
        debug!("Context updated {} in {}", key, scope);
        self.emit(ContextEvent::Updated {
            scope: scope.clone(),
            key: key.to_string(),
        });
        true
    }

    /// Remove an item. Returns false if it was missing or already expired.
    pub fn delete(&self, key: &str, scope: &Scope) -> bool {
        let removed = match self.partitions.get_mut(scope) {
            Some(mut partition) => partition.remove(key),
            None => None,
        };
        self.partitions.remove_if(scope, |_, items| items.is_empty());

        match removed {
            Some(item) if item.is_expired() => {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                self.emit(ContextEvent::Expired {
                    scope: scope.clone(),
                    key: key.to_string(),
                });
                false
            }
            Some(_) => {
                debug!("Context deleted {} in {}", key, scope);
                self.emit(ContextEvent::Deleted {
                    scope: scope.clone(),
                    key: key.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, key: &str, scope: &Scope) -> bool {
        self.get_item(key, scope).is_some()
    }

    /// Live keys in a partition.
    pub fn keys(&self, scope: &Scope) -> Vec<String> {
        let mut keys: Vec<String> = match self.partitions.get(scope) {
            Some(partition) => partition
                .values()
                .filter(|item| !item.is_expired())
                .map(|item| item.key.clone())
                .collect(),
            None => Vec::new(),
        };
        keys.sort();
        keys
    }

    /// Live items in a partition carrying every tag in `tags`.
    pub fn get_by_tags(&self, tags: &[&str], scope: &Scope) -> Vec<ContextItem> {
        let mut items: Vec<ContextItem> = match self.partitions.get(scope) {
            Some(partition) => partition
                .values()
                .filter(|item| !item.is_expired() && item.has_tags(tags.iter().copied()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    /// Drop a whole partition. Returns the number of items removed.
    pub fn clear_scope(&self, scope: &Scope) -> usize {
        let removed = self
            .partitions
            .remove(scope)
            .map(|(_, items)| items.len())
            .unwrap_or(0);

        if removed > 0 {
            info!("Cleared {} context items from {}", removed, scope);
        }
        self.emit(ContextEvent::Cleared {
            scope: scope.clone(),
            removed,
        });
        removed
    }

    /// Physically remove expired items from every partition.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();

        for mut partition in self.partitions.iter_mut() {
            let scope = partition.key().clone();
            partition.value_mut().retain(|key, item| {
                if item.is_expired_at(now) {
                    expired.push((scope.clone(), key.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.partitions.retain(|_, items| !items.is_empty());

        let count = expired.len();
        if count > 0 {
            self.expired_count.fetch_add(count as u64, Ordering::Relaxed);
            debug!("Cleaned up {} expired context items", count);
        }
        for (scope, key) in expired {
            self.emit(ContextEvent::Expired { scope, key });
        }
        count
    }

    pub fn statistics(&self) -> ContextStatistics {
        let mut stats = ContextStatistics {
            expired_items: self.expired_count.load(Ordering::Relaxed),
            update_count: self.update_count.load(Ordering::Relaxed),
            ..ContextStatistics::default()
        };

        for partition in self.partitions.iter() {
            let live = partition.value().values().filter(|i| !i.is_expired()).count();
            stats.total_items += live;
            match partition.key() {
                Scope::Global => stats.global_items += live,
                Scope::Agent(_) => stats.agent_partitions += 1,
                Scope::Session(_) => stats.session_partitions += 1,
                Scope::User(_) => stats.user_partitions += 1,
            }
        }
        stats
    }

    /// Copy every live item.
    pub fn export(&self) -> ContextSnapshot {
        let mut items: Vec<ContextItem> = self
            .partitions
            .iter()
            .flat_map(|partition| {
                partition
                    .value()
                    .values()
                    .filter(|item| !item.is_expired())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        items.sort_by(|a, b| a.scope.cmp(&b.scope).then_with(|| a.key.cmp(&b.key)));

        ContextSnapshot {
            exported_at: Utc::now(),
            items,
        }
    }

    /// Load items from a snapshot, keeping their timestamps. Expired items are skipped.
    pub fn import(&self, snapshot: ContextSnapshot) -> usize {
        let mut imported = 0;
        for item in snapshot.items {
            if item.is_expired() {
                continue;
            }
            let scope = item.scope.clone();
            let key = item.key.clone();
            self.partitions
                .entry(scope.clone())
                .or_default()
                .insert(key.clone(), item);
            self.emit(ContextEvent::Set { scope, key });
            imported += 1;
        }
        info!("Imported {} context items", imported);
        imported
    }

    /// Start the periodic cleanup sweep. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let store: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.cleanup_interval.max(std::time::Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        store.cleanup_expired();
                    }
                }
            }
            debug!("Context cleanup sweep stopped");
        });

        *sweeper = Some(Sweeper { shutdown, task });
        info!("Context store started (cleanup every {:?})", interval);
    }

    /// Stop the cleanup sweep and wait for it to finish.
    pub async fn stop(&self) {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return;
        };
        let _ = sweeper.shutdown.send(true);
        if let Err(e) = sweeper.task.await {
            warn!("Context cleanup task ended abnormally: {}", e);
        }
        info!("Context store stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.sweeper.lock().await.is_some()
    }
}
