//! Runtime configuration
//!
//! Everything has a default; a YAML file may override any subset:
//!
//! ```yaml
//! retry:
//!   initialDelayMs: 100
//!   maxDelayMs: 10000
//! watchBuffer: 256
//! maxErrorRetries: 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::Error;

/// Default per-scope watch buffer (events)
pub const DEFAULT_WATCH_BUFFER: usize = 256;

/// Default number of retries for non-transient reconcile errors
pub const DEFAULT_MAX_ERROR_RETRIES: u32 = 5;

/// Tuning knobs for the store and the controller runtime
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Backoff between reconcile retries
    pub retry: RetryConfig,
    /// Events buffered per watch scope before a watcher is marked lagging
    pub watch_buffer: usize,
    /// Retries for render and other non-transient errors before a
    /// controller idles until its next input change
    pub max_error_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
            max_error_retries: DEFAULT_MAX_ERROR_RETRIES,
        }
    }
}

impl RuntimeConfig {
    /// Load from a YAML file; missing fields take their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
