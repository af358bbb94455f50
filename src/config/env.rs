//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "TAPTREE";

/// Configuration read from `TAPTREE_*` variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Per-test timeout from TAPTREE_TIMEOUT_MS
    pub timeout_ms: Option<u64>,
    /// Top-level concurrency from TAPTREE_CONCURRENCY
    pub concurrency: Option<usize>,
    /// Name filter from TAPTREE_FILTER
    pub filter: Option<String>,
    /// Bail on failure from TAPTREE_BAIL
    pub bail: Option<bool>,
    /// Log level from TAPTREE_LOG
    pub log: Option<String>,
    /// Config file from TAPTREE_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            timeout_ms: get_env_parse("TIMEOUT_MS"),
            concurrency: get_env_parse("CONCURRENCY"),
            filter: get_env("FILTER"),
            bail: get_env_bool("BAIL"),
            log: get_env("LOG"),
            config_file: get_env("CONFIG"),
        }
    }

    pub fn has_any(&self) -> bool {
        self.timeout_ms.is_some()
            || self.concurrency.is_some()
            || self.filter.is_some()
            || self.bail.is_some()
            || self.log.is_some()
            || self.config_file.is_some()
    }
}

fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_TIMEOUT_MS"), timeout_ms.to_string()));
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_CONCURRENCY"), limit.to_string()));
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_FILTER"), filter.into()));
        self
    }

    pub fn bail(mut self, bail: bool) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_BAIL"), bail.to_string()));
        self
    }

    /// Set an arbitrary variable, without the prefix
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
