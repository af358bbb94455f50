//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::config::HarnessConfig;

/// Run test executables concurrently and report them as one TAP stream
#[derive(Parser, Debug)]
#[command(name = "taptree")]
#[command(version)]
#[command(about = "Run test executables concurrently and report them as one TAP stream")]
#[command(long_about = None)]
pub struct Args {
    /// Test executables, each run as one top-level test
    pub files: Vec<PathBuf>,

    /// Per-test timeout in milliseconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Maximum number of files running at once
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Only run files whose path contains this
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Stop at the first failing file
    #[arg(short, long)]
    pub bail: bool,

    /// Path to a YAML or JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Omit the count diagnostics at the end of the stream
    #[arg(long)]
    pub no_summary: bool,

    /// Log level for harness diagnostics on stderr
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Override `config` with the flags that were given
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(timeout) = self.timeout {
            config.timeout_ms = Some(timeout);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = Some(concurrency);
        }
        if let Some(filter) = &self.filter {
            config.name_filter = Some(filter.clone());
        }
        if self.bail {
            config.bail_on_failure = true;
        }
        if self.no_summary {
            config.summary = false;
        }
    }
}
