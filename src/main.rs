//! taptree - run test executables as one TAP stream
//!
//! Every file given on the command line runs concurrently as a top-level
//! test. Each file's own TAP output is nested under its test line, and the
//! combined stream is written to stdout in command-line order.
//!
//! ## Usage
//!
//! ```bash
//! # Run two test files
//! taptree tests/parser.sh tests/network.sh
//!
//! # At most two at a time, ten second timeout, stop at the first failure
//! taptree -j 2 --timeout 10000 --bail tests/*.sh
//! ```

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::debug;

use taptree::cli::Args;
use taptree::config::{expand_path, EnvConfig, HarnessConfig};
use taptree::utils::{init_logger, LogLevel};
use taptree::{process, Harness};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();

    let level = args
        .log_level
        .as_deref()
        .or(env.log.as_deref())
        .and_then(|level| level.parse().ok())
        .unwrap_or(if args.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        });
    init_logger(level);

    let config_path = args
        .config
        .clone()
        .or_else(|| env.config_file.as_deref().map(expand_path));
    let mut config = match config_path {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::load_default()?,
    };
    config.apply_env(&env);
    args.apply(&mut config);
    if process::is_child() {
        config.summary = false;
    }
    debug!(?config, "resolved configuration");

    let mut harness = Harness::try_new(config, tokio::io::stdout())?;
    for file in &args.files {
        harness.test(display_name(file), process::file_test(file.clone()));
    }

    let report = harness.run().await?;
    debug!("run summary:\n{}", report.summary);
    std::process::exit(report.summary.exit_code());
}

fn display_name(path: &Path) -> String {
    path.display().to_string()
}
