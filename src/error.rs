//! Harness-level errors
//!
//! Failures of test bodies are results, not errors. These are the ways the
//! harness itself can fail to produce a result stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to write the result stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("result writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
