//! Configuration parsing and validation.
//!
//! Context Feeder is configured via a TOML file (default: `config/feeder.toml`).
//! The file has global `[broker]` and `[store]` sections that every task
//! inherits, and one `[[tasks]]` entry per feeding task. A task may override
//! any broker or store field in its own `[tasks.broker]` / `[tasks.store]`
//! table; unspecified fields fall back to the global value.
//!
//! ```toml
//! [endpoint]
//! bind = "0.0.0.0:9000"
//! id = "feeder-1"
//! url = "http://feeder:9000"
//!
//! [broker]
//! uri = "http://orion:1026"
//! tenant = "acme"
//!
//! [store]
//! uri = "http://elasticsearch:9200"
//!
//! [[tasks]]
//! trigger = "time"
//! period_secs = 60
//! ```
//!
//! [`load_config`] validates the whole file up front, so a running feeder
//! never sees an inconsistent configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use context_feeder_core::models::{BrokerSettings, EntityFilter, StoreSettings, TaskConfig, Trigger};

use crate::orchestrator::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

/// This process as seen from the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Listen address of the notification receiver.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Identifies this feeder instance in subscription descriptions.
    #[serde(default = "default_endpoint_id")]
    pub id: String,
    /// Externally reachable base URL; webhooks are built from it.
    pub url: String,
}

fn default_bind() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_endpoint_id() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub uri: String,
    pub tenant: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

fn default_scope() -> String {
    "/".to_string()
}
/// Largest `limit` an NGSI v2 broker accepts on entity queries.
pub const MAX_PAGE_SIZE: usize = 1000;

fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}
fn default_broker_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub uri: String,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_ping_timeout() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    150
}

/// Timing of task starts, retries, and the init connectivity probe.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_stagger")]
    pub start_stagger_ms: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval_secs: u64,
    #[serde(default)]
    pub retry_max_attempts: Option<u32>,
    #[serde(default = "default_connect_retry")]
    pub connect_retry_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_stagger_ms: default_stagger(),
            retry_interval_secs: default_retry_interval(),
            retry_backoff: default_retry_backoff(),
            retry_max_interval_secs: default_retry_max_interval(),
            retry_max_attempts: None,
            connect_retry_secs: default_connect_retry(),
        }
    }
}

fn default_stagger() -> u64 {
    500
}
fn default_retry_interval() -> u64 {
    30
}
fn default_retry_backoff() -> f64 {
    1.0
}
fn default_retry_max_interval() -> u64 {
    600
}
fn default_connect_retry() -> u64 {
    15
}

impl ScheduleConfig {
    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.retry_interval_secs),
            backoff: self.retry_backoff,
            max_interval: Duration::from_secs(self.retry_max_interval_secs),
            max_attempts: self.retry_max_attempts,
        }
    }
}

/// One `[[tasks]]` entry as written in the file.
#[derive(Debug, Deserialize, Clone)]
pub struct TaskEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub trigger: Trigger,
    #[serde(default)]
    pub period_secs: Option<u64>,
    #[serde(default)]
    pub throttling_secs: Option<u64>,
    #[serde(default)]
    pub filter: EntityFilter,
    #[serde(default)]
    pub broker: BrokerOverride,
    #[serde(default)]
    pub store: StoreOverride,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BrokerOverride {
    pub uri: Option<String>,
    pub tenant: Option<String>,
    pub scope: Option<String>,
    pub page_size: Option<usize>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreOverride {
    pub uri: Option<String>,
    pub ping_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    /// Resolve every task entry against the global defaults.
    pub fn task_configs(&self) -> Vec<TaskConfig> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(i, entry)| self.resolve(i, entry))
            .collect()
    }

    fn resolve(&self, position: usize, entry: &TaskEntry) -> TaskConfig {
        let b = &entry.broker;
        let s = &entry.store;
        TaskConfig {
            name: entry
                .name
                .clone()
                .unwrap_or_else(|| format!("task-{}", position + 1)),
            broker: BrokerSettings {
                uri: b.uri.clone().unwrap_or_else(|| self.broker.uri.clone()),
                tenant: b.tenant.clone().unwrap_or_else(|| self.broker.tenant.clone()),
                scope: b.scope.clone().unwrap_or_else(|| self.broker.scope.clone()),
                page_size: b.page_size.unwrap_or(self.broker.page_size),
                timeout: Duration::from_secs(b.timeout_secs.unwrap_or(self.broker.timeout_secs)),
            },
            store: StoreSettings {
                uri: s.uri.clone().unwrap_or_else(|| self.store.uri.clone()),
                ping_timeout: Duration::from_secs(
                    s.ping_timeout_secs.unwrap_or(self.store.ping_timeout_secs),
                ),
                request_timeout: Duration::from_secs(
                    s.request_timeout_secs
                        .unwrap_or(self.store.request_timeout_secs),
                ),
            },
            filter: entry.filter.clone(),
            trigger: entry.trigger,
            period: entry.period_secs.map(Duration::from_secs),
            throttling: entry.throttling_secs.map(Duration::from_secs),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.endpoint.url.trim().is_empty() {
        bail!("endpoint.url must not be empty");
    }

    // Validate schedule
    let schedule = &config.schedule;
    if schedule.retry_interval_secs == 0 {
        bail!("schedule.retry_interval_secs must be > 0");
    }
    if schedule.retry_backoff.is_nan() || schedule.retry_backoff < 1.0 {
        bail!("schedule.retry_backoff must be >= 1.0");
    }
    if schedule.connect_retry_secs == 0 {
        bail!("schedule.connect_retry_secs must be > 0");
    }

    if config.tasks.is_empty() {
        bail!("at least one [[tasks]] entry is required");
    }

    for (task, entry) in config.task_configs().iter().zip(&config.tasks) {
        validate_task(task, entry)?;
    }

    Ok(config)
}

fn validate_task(task: &TaskConfig, entry: &TaskEntry) -> Result<()> {
    let name = &task.name;
    if task.broker.uri.trim().is_empty() {
        bail!("task '{}': broker.uri must not be empty", name);
    }
    if task.broker.tenant.trim().is_empty() {
        bail!("task '{}': broker.tenant must not be empty", name);
    }
    if !task.broker.scope.starts_with('/') {
        bail!(
            "task '{}': broker.scope must start with '/', got '{}'",
            name,
            task.broker.scope
        );
    }
    if task.broker.page_size == 0 || task.broker.page_size > MAX_PAGE_SIZE {
        bail!(
            "task '{}': broker.page_size must be between 1 and {}, got {}",
            name,
            MAX_PAGE_SIZE,
            task.broker.page_size
        );
    }
    if task.broker.timeout.is_zero() {
        bail!("task '{}': broker.timeout_secs must be > 0", name);
    }
    if task.store.uri.trim().is_empty() {
        bail!("task '{}': store.uri must not be empty", name);
    }
    if task.store.ping_timeout.is_zero() || task.store.request_timeout.is_zero() {
        bail!("task '{}': store timeouts must be > 0", name);
    }
    if entry.period_secs == Some(0) {
        bail!("task '{}': period_secs must be > 0", name);
    }
    Ok(())
}
