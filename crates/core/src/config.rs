use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AwexError, Result};

/// Load a .env file into the environment (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Pool configuration, read from `AWEX_*` env vars or a TOML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwexConfig {
    /// Workers kept alive on the default queue even when idle.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound on workers for the default queue. 0 = available parallelism.
    #[serde(default)]
    pub max_workers: usize,
    /// Tasks at or above this priority bypass the queue.
    #[serde(default)]
    pub realtime_priority: Option<i32>,
    /// Partitions used by `fan_out`. 0 = available parallelism.
    #[serde(default)]
    pub fan_out_partitions: usize,
    /// Queue-wait timeout for tasks that do not set their own. 0 = none.
    #[serde(default)]
    pub queue_timeout_ms: u64,
    /// Execution timeout for tasks that do not set their own. 0 = none.
    #[serde(default)]
    pub execution_timeout_ms: u64,
    /// Prefix for worker and callback thread names.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_min_workers() -> usize { 1 }
fn default_thread_name_prefix() -> String { "awex".into() }

impl Default for AwexConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: 0,
            realtime_priority: None,
            fan_out_partitions: 0,
            queue_timeout_ms: 0,
            execution_timeout_ms: 0,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl AwexConfig {
    /// Build config from `AWEX_*` environment variables, falling back to
    /// defaults. Call [`load_dotenv`] first to pick up a .env file.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_workers: env_parse("AWEX_MIN_WORKERS", defaults.min_workers),
            max_workers: env_parse("AWEX_MAX_WORKERS", defaults.max_workers),
            realtime_priority: env_opt("AWEX_REALTIME_PRIORITY").and_then(|v| v.parse().ok()),
            fan_out_partitions: env_parse("AWEX_FAN_OUT_PARTITIONS", defaults.fan_out_partitions),
            queue_timeout_ms: env_parse("AWEX_QUEUE_TIMEOUT_MS", defaults.queue_timeout_ms),
            execution_timeout_ms: env_parse(
                "AWEX_EXECUTION_TIMEOUT_MS",
                defaults.execution_timeout_ms,
            ),
            thread_name_prefix: env_opt("AWEX_THREAD_NAME_PREFIX")
                .unwrap_or(defaults.thread_name_prefix),
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AwexError::Config(e.to_string()))
    }

    /// Resolve the worker ceiling (0 means use available parallelism).
    /// Never below `min_workers`.
    pub fn resolved_max_workers(&self) -> usize {
        let max = if self.max_workers == 0 {
            available_parallelism()
        } else {
            self.max_workers
        };
        max.max(self.min_workers).max(1)
    }

    /// Resolve the fan-out partition count (0 means use available parallelism).
    pub fn resolved_fan_out_partitions(&self) -> usize {
        if self.fan_out_partitions == 0 {
            available_parallelism()
        } else {
            self.fan_out_partitions
        }
    }

    /// Log the effective settings at startup.
    pub fn log_summary(&self) {
        info!(
            min_workers = self.min_workers,
            max_workers = self.resolved_max_workers(),
            realtime_priority = ?self.realtime_priority,
            fan_out_partitions = self.resolved_fan_out_partitions(),
            queue_timeout_ms = self.queue_timeout_ms,
            execution_timeout_ms = self.execution_timeout_ms,
            "awex config"
        );
    }

    pub fn default_queue_timeout(&self) -> Option<Duration> {
        (self.queue_timeout_ms > 0).then(|| Duration::from_millis(self.queue_timeout_ms))
    }

    pub fn default_execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_ms > 0).then(|| Duration::from_millis(self.execution_timeout_ms))
    }
}
