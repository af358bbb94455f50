//! Test outcome models
//!
//! Defines the settled status of a reported test and the run-wide summary.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FailureKind;

/// Settled status of a single test
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Cancelled,
    Skip,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Pass => "✓",
            TestStatus::Fail => "✗",
            TestStatus::Cancelled => "!",
            TestStatus::Skip => "○",
        }
    }

    /// Whether this status fails the parent and the run
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Cancelled)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "PASS"),
            TestStatus::Fail => write!(f, "FAIL"),
            TestStatus::Cancelled => write!(f, "CANCELLED"),
            TestStatus::Skip => write!(f, "SKIP"),
        }
    }
}

/// Final outcome of one test, available once it has been torn down
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub number: usize,
    pub status: TestStatus,
    pub todo: bool,
    pub duration_ms: f64,
    pub message: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl TestOutcome {
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} - {} [{:.3}ms]",
            self.status.symbol(),
            self.number,
            self.name,
            self.duration_ms
        )?;
        if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Counters accumulated as tests are reported
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub todo: usize,
}

impl TestCounts {
    pub fn record(&mut self, status: TestStatus, todo: bool) {
        self.tests += 1;
        match status {
            TestStatus::Pass => self.passed += 1,
            TestStatus::Fail => self.failed += 1,
            TestStatus::Cancelled => self.cancelled += 1,
            TestStatus::Skip => self.skipped += 1,
        }
        if todo {
            self.todo += 1;
        }
    }
}

/// Summary of a whole harness run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub counts: TestCounts,
    pub duration_ms: f64,
    pub bailed: bool,
    /// Outcomes of the top-level tests in declaration order
    pub results: Vec<TestOutcome>,
}

impl RunSummary {
    /// True when every top-level test passed (or was skipped) and the stream
    /// was not bailed out
    pub fn is_success(&self) -> bool {
        !self.bailed && self.results.iter().all(|r| !r.is_failure())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(f, "  {result}")?;
        }
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Cancelled: {} | Skip: {} | Todo: {}",
            self.counts.tests,
            self.counts.passed,
            self.counts.failed,
            self.counts.cancelled,
            self.counts.skipped,
            self.counts.todo
        )?;
        write!(f, "Duration: {:.3}ms", self.duration_ms)
    }
}
