//! Child-process tests
//!
//! Runs an external program as the body of a test. The program's standard
//! output is treated as a result stream of its own and nested under the
//! test's line; the test fails when the program exits unsuccessfully.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tracing::debug;

use crate::executor::TestContext;

/// Set in the environment of every child, so a program can tell it is
/// reporting to a parent harness
pub const CHILD_ENV: &str = "TAPTREE_CHILD";

/// True when this process was started by a parent harness
pub fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Test body running the executable at `path`
pub fn file_test(
    path: impl Into<PathBuf>,
) -> impl FnOnce(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static {
    command_test(path, Vec::new())
}

/// Test body running `program` with `args`
pub fn command_test(
    program: impl Into<PathBuf>,
    args: Vec<String>,
) -> impl FnOnce(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static {
    let program = program.into();
    move |ctx| run_child(ctx, program, args).boxed()
}

async fn run_child(ctx: TestContext, program: PathBuf, args: Vec<String>) -> anyhow::Result<()> {
    debug!(program = %program.display(), "starting child");

    let output = Command::new(&program)
        .args(&args)
        .env(CHILD_ENV, "1")
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run {}", program.display()))?;

    ctx.embed_output(&String::from_utf8_lossy(&output.stdout));
    check_status(output.status)
}

fn check_status(status: ExitStatus) -> anyhow::Result<()> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        bail!("child exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            bail!("child terminated by signal {signal}");
        }
    }
    bail!("child failed: {status}")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::executor::Harness;
    use std::os::unix::process::ExitStatusExt;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(ExitStatus::from_raw(0)).is_ok());

        let err = check_status(ExitStatus::from_raw(3 << 8)).unwrap_err();
        assert_eq!(err.to_string(), "child exited with code 3");

        let err = check_status(ExitStatus::from_raw(9)).unwrap_err();
        assert_eq!(err.to_string(), "child terminated by signal 9");
    }

    #[tokio::test]
    async fn test_child_stream_is_nested() {
        let config = HarnessConfig {
            summary: false,
            ..HarnessConfig::default()
        };
        let mut harness = Harness::new(config, Vec::new());
        harness
            .test(
                "passing child",
                command_test(
                    "sh",
                    sh("printf 'TAP version 13\\n\\n1..1\\nok 1 - inner\\n'; test \"$TAPTREE_CHILD\" = 1"),
                ),
            )
            .test("failing child", command_test("sh", sh("echo 'not ok 1 - x'; exit 2")));

        let report = harness.run().await.unwrap();
        let out = String::from_utf8(report.output).unwrap();

        assert!(out.contains("    1..1\n    ok 1 - inner\nok 1 - passing child\n"));
        assert!(out.contains("    not ok 1 - x\nnot ok 2 - failing child\n"));
        assert!(out.contains("error: child exited with code 2"));
        assert_eq!(out.matches("TAP version").count(), 1);
        assert_eq!(report.summary.counts.failed, 1);
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let config = HarnessConfig {
            summary: false,
            ..HarnessConfig::default()
        };
        let mut harness = Harness::new(config, Vec::new());
        harness.test("missing", file_test("/nonexistent/taptree-test-file"));

        let report = harness.run().await.unwrap();
        let out = String::from_utf8(report.output).unwrap();
        assert!(out.contains("error: No such file or directory"));
        assert!(!report.summary.is_success());
    }
}
