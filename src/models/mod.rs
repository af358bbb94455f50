//! Data models for test execution
//!
//! Outcomes, summaries and the failure taxonomy shared by the executor and
//! the output layer.

mod failure;
mod test_result;

pub use failure::{FailureKind, TestFailure};
pub use test_result::{RunSummary, TestCounts, TestOutcome, TestStatus};
