//! Runtime configuration for agentry.
//!
//! A [`RuntimeConfig`] is built once at process start (from a JSON file,
//! defaults and a few environment overrides) and handed to the bus, the
//! context store and the manager. Nothing reads configuration globally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{Payload, Priority};

/// Get the default configuration file path.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "agentry", "agentry")
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    Ok(dirs.config_dir().join("agentry.json"))
}

/// Load configuration from a JSON file, apply environment overrides and validate.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    load_with(path.as_ref(), env_var)
}

/// Load the configuration file if it exists, otherwise start from defaults.
///
/// Environment overrides and validation apply either way. A file that exists
/// but cannot be read or parsed is an error.
pub fn load_config_or_default(path: Option<&Path>) -> Result<RuntimeConfig> {
    load_or_default_with(path, env_var)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn load_with<F>(path: &Path, lookup: F) -> Result<RuntimeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if !path.exists() {
        return Err(Error::Config(format!(
            "Config file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut config: RuntimeConfig = serde_json::from_str(&content)?;
    config.apply_overrides(lookup)?;
    config.validate()?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

fn load_or_default_with<F>(path: Option<&Path>, lookup: F) -> Result<RuntimeConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().ok(),
    };

    match path {
        Some(path) if path.exists() => load_with(&path, lookup),
        _ => {
            let mut config = RuntimeConfig::default();
            config.apply_overrides(lookup)?;
            config.validate()?;
            Ok(config)
        }
    }
}

/// Message bus configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BusConfig {
    /// Capacity of each per-agent inbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Size of the recent-message ring buffer.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Dead letters retained for inspection before the oldest is dropped.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_max_history() -> usize {
    1000
}

fn default_dead_letter_capacity() -> usize {
    10_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_history: default_max_history(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

/// Context store configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContextConfig {
    /// Interval of the expired-item sweep.
    #[serde(default = "default_cleanup_interval", with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Buffered change events per subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cleanup_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Agent manager configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ManagerConfig {
    /// Interval of the health monitor.
    #[serde(default = "default_health_check_interval", with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Pause between stop and start during a restart.
    #[serde(default = "default_restart_delay", with = "duration_secs")]
    pub restart_delay: Duration,
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            restart_delay: default_restart_delay(),
        }
    }
}

impl ManagerConfig {
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }
}

/// Per-agent configuration held by the manager.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Inactivity after which the health monitor treats the agent as stalled.
    #[serde(default = "default_max_idle_time", with = "duration_secs")]
    pub max_idle_time: Duration,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agent-defined settings, opaque to the runtime.
    #[serde(default)]
    pub settings: Payload,
    #[serde(default)]
    pub metadata: Payload,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_idle_time() -> Duration {
    Duration::from_secs(300)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: true,
            auto_restart: true,
            max_retries: default_max_retries(),
            max_idle_time: default_max_idle_time(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            capabilities: Vec::new(),
            settings: Payload::new(),
            metadata: Payload::new(),
        }
    }
}

impl AgentConfig {
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rolling log file.
    #[serde(default)]
    pub file: bool,
    /// Log directory; defaults to the platform data dir.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info,agentry=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: false,
            directory: None,
        }
    }
}

/// Complete runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    /// Agent configurations keyed by agent id.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Override selected values from `AGENTRY_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(env_var)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("AGENTRY_HEALTH_CHECK_INTERVAL") {
            self.manager.health_check_interval = parse_secs("AGENTRY_HEALTH_CHECK_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("AGENTRY_CLEANUP_INTERVAL") {
            self.context.cleanup_interval = parse_secs("AGENTRY_CLEANUP_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("AGENTRY_QUEUE_CAPACITY") {
            self.bus.queue_capacity = raw.trim().parse().map_err(|_| {
                Error::Config(format!("AGENTRY_QUEUE_CAPACITY: invalid number '{}'", raw))
            })?;
        }
        if let Some(raw) = lookup("AGENTRY_LOG_LEVEL") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.logging.level = trimmed.to_string();
            }
        }
        Ok(())
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.bus.queue_capacity == 0 {
            return Err(Error::Config("bus.queue_capacity must be greater than 0".to_string()));
        }
        if self.context.event_capacity == 0 {
            return Err(Error::Config("context.event_capacity must be greater than 0".to_string()));
        }
        if self.context.cleanup_interval.is_zero() {
            return Err(Error::Config("context.cleanup_interval must be greater than 0".to_string()));
        }
        if self.manager.health_check_interval.is_zero() {
            return Err(Error::Config(
                "manager.health_check_interval must be greater than 0".to_string(),
            ));
        }
        for (agent_id, agent) in &self.agents {
            if agent.dependencies.iter().any(|d| d == agent_id) {
                return Err(Error::Config(format!(
                    "agents.{} depends on itself",
                    agent_id
                )));
            }
        }
        Ok(())
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}: invalid number of seconds '{}'", name, raw)))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::Config(format!("{}: out of range '{}'", name, raw)))
}

/// Serialize durations as (fractional) seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
