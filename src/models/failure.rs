//! Failure taxonomy for test nodes
//!
//! Every reported failure carries a kind (rendered as `failureType`), a
//! human-readable message and, when the failure wraps an error raised by
//! test code, that inner error.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a test node failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The body returned an error or panicked
    TestCodeFailure,
    /// The body passed but one or more subtests failed
    SubtestsFailed,
    /// The parent finished while this test was still running
    CancelledByParent,
    /// The test was declared after its parent had already finished
    ParentAlreadyFinished,
    /// Detached work owned by the test panicked
    UncaughtException,
    /// Detached work owned by the test returned an error nobody observed
    UnhandledRejection,
    /// The body did not settle within the configured timeout
    TestTimeoutFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TestCodeFailure => "testCodeFailure",
            FailureKind::SubtestsFailed => "subtestsFailed",
            FailureKind::CancelledByParent => "cancelledByParent",
            FailureKind::ParentAlreadyFinished => "parentAlreadyFinished",
            FailureKind::UncaughtException => "uncaughtException",
            FailureKind::UnhandledRejection => "unhandledRejection",
            FailureKind::TestTimeoutFailure => "testTimeoutFailure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The retained cause of a failed test
#[derive(Debug)]
pub struct TestFailure {
    pub kind: FailureKind,
    message: String,
    cause: Option<anyhow::Error>,
    stack: Option<String>,
}

impl TestFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            stack: None,
        }
    }

    /// Failure raised by the test body itself
    pub fn test_code(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::TestCodeFailure,
            message: error.to_string(),
            cause: Some(error),
            stack: None,
        }
    }

    pub fn subtests_failed(count: usize) -> Self {
        let noun = if count == 1 { "subtest" } else { "subtests" };
        Self::new(FailureKind::SubtestsFailed, format!("{count} {noun} failed"))
    }

    pub fn cancelled_by_parent() -> Self {
        Self::new(
            FailureKind::CancelledByParent,
            "test did not finish before its parent and was cancelled",
        )
    }

    pub fn parent_already_finished() -> Self {
        Self::new(
            FailureKind::ParentAlreadyFinished,
            "test could not be started because its parent finished",
        )
    }

    pub fn timed_out(timeout_ms: u128) -> Self {
        Self::new(
            FailureKind::TestTimeoutFailure,
            format!("test timed out after {timeout_ms}ms"),
        )
    }

    /// Wrap an error observed through the out-of-band channel
    pub fn out_of_band(kind: FailureKind, error: anyhow::Error) -> Self {
        Self {
            kind,
            message: format!("{kind} failure"),
            cause: Some(error),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The message shown in the details block.
    ///
    /// When the failure wraps an error, the innermost error of its chain is
    /// preferred over the wrapper's generic message.
    pub fn error_message(&self) -> String {
        match &self.cause {
            Some(cause) => cause.root_cause().to_string(),
            None => self.message.clone(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }


    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error_message(), self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn test_subtests_failed_pluralization() {
        assert_eq!(TestFailure::subtests_failed(1).message(), "1 subtest failed");
        assert_eq!(TestFailure::subtests_failed(3).message(), "3 subtests failed");
    }

    #[test]
    fn test_out_of_band_prefers_inner_message() {
        let failure =
            TestFailure::out_of_band(FailureKind::UncaughtException, anyhow!("disk full"));
        assert_eq!(failure.message(), "uncaughtException failure");
        assert_eq!(failure.error_message(), "disk full");
    }

    #[test]
    fn test_test_code_prefers_innermost_error() {
        let err = Err::<(), _>(anyhow!("boom"))
            .context("loading fixture")
            .context("setting up")
            .unwrap_err();
        let failure = TestFailure::test_code(err);
        assert_eq!(failure.kind, FailureKind::TestCodeFailure);
        assert_eq!(failure.message(), "setting up");
        assert_eq!(failure.error_message(), "boom");
    }

    #[test]
    fn test_out_of_band_unwraps_nested_cause() {
        let inner = Err::<(), _>(anyhow!("connection reset"))
            .context("background flush")
            .unwrap_err();
        let failure = TestFailure::out_of_band(FailureKind::UnhandledRejection, inner);
        assert_eq!(failure.error_message(), "connection reset");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(FailureKind::CancelledByParent.to_string(), "cancelledByParent");
        assert_eq!(
            serde_json::to_string(&FailureKind::TestTimeoutFailure).unwrap(),
            "\"testTimeoutFailure\""
        );
    }
}
