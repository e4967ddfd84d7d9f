use common::domain::DeviceKey;
use config::{Config, ConfigError, Environment};
use heartbeat_worker::{HandlerStrategy, HeartbeatHandlerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,

    // Heartbeat handling
    /// synchronous, compacting or process_all
    #[serde(default = "default_handler_strategy")]
    pub handler_strategy: String,

    /// Worker tasks of the process_all handler
    #[serde(default = "default_handler_workers")]
    pub handler_workers: usize,

    /// Attempts per heartbeat for the synchronous and compacting handlers
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step between attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Attempts per heartbeat for the process_all handler (0 = unbounded)
    #[serde(default)]
    pub process_all_max_attempts: u32,

    /// Requeue delay step for the process_all handler in milliseconds
    #[serde(default)]
    pub process_all_backoff_ms: u64,

    // Devices
    /// Devices registered at startup, comma-separated `namespace/name`
    #[serde(default)]
    pub seed_devices: String,

    /// JSON-lines file of heartbeats to feed through the handler
    #[serde(default)]
    pub heartbeat_replay_path: Option<String>,

    // Metrics
    /// Prometheus scrape listener
    #[serde(default = "default_metrics_listen_addr")]
    pub metrics_listen_addr: String,

    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    #[serde(default)]
    pub otel_enabled: bool,

    /// Time allowed for closers on shutdown, in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    true
}

fn default_handler_strategy() -> String {
    HandlerStrategy::Synchronous.to_string()
}

fn default_handler_workers() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_metrics_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "fleet-control-plane".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("FLEET"))
            .build()?
            .try_deserialize()
    }

    pub fn handler_config(&self) -> anyhow::Result<HeartbeatHandlerConfig> {
        let strategy: HandlerStrategy = self.handler_strategy.parse()?;
        let backoff_step = Duration::from_millis(self.retry_backoff_ms);

        let process_all_retry = RetryPolicy {
            max_attempts: match self.process_all_max_attempts {
                0 => None,
                max => Some(max),
            },
            backoff_step_ms: self.process_all_backoff_ms,
        };

        Ok(HeartbeatHandlerConfig {
            strategy,
            workers: self.handler_workers,
            synchronous_retry: RetryPolicy::bounded(self.max_attempts, backoff_step),
            compacting_retry: RetryPolicy::bounded(self.max_attempts, backoff_step),
            process_all_retry,
        })
    }

    pub fn seed_device_keys(&self) -> anyhow::Result<Vec<DeviceKey>> {
        self.seed_devices
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once('/') {
                Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                    Ok(DeviceKey::new(namespace, name))
                }
                _ => anyhow::bail!("invalid seed device '{entry}', expected namespace/name"),
            })
            .collect()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
