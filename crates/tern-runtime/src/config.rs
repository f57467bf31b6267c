//! Runtime configuration.
//!
//! Defaults come from [`RuntimeConfig::default`]; a JSON document or the
//! environment can override them.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use tern_core::HeapLimits;

/// Environment variable overriding [`RuntimeConfig::pool_size`]
pub const ENV_POOL_SIZE: &str = "TERN_POOL_SIZE";
/// Environment variable overriding [`RuntimeConfig::timeout_ms`]
pub const ENV_TIMEOUT_MS: &str = "TERN_TIMEOUT_MS";

/// Settings for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads, each with its own isolate.
    /// Default: number of CPU cores
    pub pool_size: usize,

    /// Jobs that may wait for a worker before `try_eval` reports
    /// [`RuntimeError::QueueFull`].
    /// Default: 1024
    pub queue_capacity: usize,

    /// Per-job time limit in milliseconds; `0` disables the watchdog.
    /// Default: 5000
    pub timeout_ms: u64,

    /// Install the `console` global in every worker.
    /// Default: true
    pub enable_console: bool,

    /// Heap and call-depth limits of each worker's isolate
    pub heap: HeapLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().max(1),
            queue_capacity: 1024,
            timeout_ms: 5000,
            enable_console: true,
            heap: HeapLimits::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> RuntimeResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()
    }

    /// Defaults with overrides from `TERN_POOL_SIZE` and `TERN_TIMEOUT_MS`
    pub fn from_env() -> RuntimeResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply overrides from the environment to this config
    pub fn with_env_overrides(mut self) -> RuntimeResult<Self> {
        if let Some(pool_size) = env_number(ENV_POOL_SIZE)? {
            self.pool_size = pool_size as usize;
        }
        if let Some(timeout_ms) = env_number(ENV_TIMEOUT_MS)? {
            self.timeout_ms = timeout_ms;
        }
        self.validate()
    }

    fn validate(self) -> RuntimeResult<Self> {
        if self.pool_size == 0 {
            return Err(RuntimeError::Config("pool_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(RuntimeError::Config(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.heap.max_call_depth == 0 {
            return Err(RuntimeError::Config(
                "heap.max_call_depth must be at least 1".into(),
            ));
        }
        Ok(self)
    }
}

fn env_number(name: &str) -> RuntimeResult<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RuntimeError::Config(format!("{name} must be a number, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}
