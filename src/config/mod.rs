//! Configuration module
//!
//! Harness settings, loaded from a config file and overridden by
//! environment variables and command-line flags.

mod env;
mod file;

pub use env::{EnvBuilder, EnvConfig, EnvGuard};
pub use file::{expand_path, CONFIG_LOCATIONS};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::output::sink::DEFAULT_CAPACITY;

/// Settings for one harness run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Per-test timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// Maximum number of top-level tests running at once
    pub concurrency: Option<usize>,

    /// Only run top-level tests whose name contains this
    pub name_filter: Option<String>,

    /// Stop the run at the first top-level failure
    pub bail_on_failure: bool,

    /// Records the result channel holds before the sink buffers
    pub sink_capacity: usize,

    /// Emit count diagnostics at the end of the stream
    pub summary: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            concurrency: None,
            name_filter: None,
            bail_on_failure: false,
            sink_capacity: DEFAULT_CAPACITY,
            summary: true,
        }
    }
}

impl HarnessConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn matches_filter(&self, name: &str) -> bool {
        match &self.name_filter {
            Some(filter) => name.contains(filter.as_str()),
            None => true,
        }
    }

    /// Override settings with values from the environment
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(timeout_ms) = env.timeout_ms {
            self.timeout_ms = Some(timeout_ms);
        }
        if let Some(concurrency) = env.concurrency {
            self.concurrency = Some(concurrency);
        }
        if let Some(filter) = &env.filter {
            self.name_filter = Some(filter.clone());
        }
        if let Some(bail) = env.bail {
            self.bail_on_failure = bail;
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.name_filter = Some(filter.into());
        self
    }

    pub fn bail_on_failure(mut self, bail: bool) -> Self {
        self.bail_on_failure = bail;
        self
    }
}
