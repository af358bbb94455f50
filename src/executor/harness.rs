//! Root of a test run
//!
//! [`Harness`] collects top-level tests, runs them concurrently and streams
//! their results in declaration order to an async writer.

use std::future::Future;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::Semaphore;
use tracing::info;

use super::runner::{self, Body};
use super::scope;
use super::tree::{Declared, NodeId, Tree, ROOT};
use super::{Shared, TestContext};
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::models::RunSummary;
use crate::output::{sink, SinkReceiver, TapReporter};

/// Skip reason for top-level tests excluded by the name filter
pub const FILTERED_REASON: &str = "test name does not match filter";

/// Outcome of a run: the summary and the writer the stream went to
#[derive(Debug)]
pub struct RunReport<W> {
    pub summary: RunSummary,
    pub output: W,
}

pub struct Harness<W> {
    shared: Arc<Shared>,
    config: HarnessConfig,
    pending: Vec<(NodeId, Body)>,
    receiver: SinkReceiver,
    writer: W,
}

impl Harness<tokio::io::Stdout> {
    /// Harness streaming to standard output
    pub fn stdout(config: HarnessConfig) -> Self {
        Self::new(config, tokio::io::stdout())
    }
}

impl<W> Harness<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(config: HarnessConfig, writer: W) -> Self {
        let (sink, receiver) = sink::channel(config.sink_capacity);
        let tree = Tree::new(TapReporter::new(sink), config.bail_on_failure);
        let shared = Arc::new(Shared::new(tree, config.timeout()));

        Self {
            shared,
            config,
            pending: Vec::new(),
            receiver,
            writer,
        }
    }

    /// Like [`Harness::new`], rejecting settings that cannot run
    pub fn try_new(config: HarnessConfig, writer: W) -> Result<Self, HarnessError> {
        config
            .validate()
            .map_err(|e| HarnessError::Config(format!("{e:#}")))?;
        Ok(Self::new(config, writer))
    }

    /// Declare a top-level test. Nothing runs until [`Harness::run`].
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: FnOnce(TestContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let selected = self.config.matches_filter(&name);

        let declared = self.shared.with_tree(|tree| tree.declare(ROOT, name));
        let Declared::Pending(id) = declared else {
            return self;
        };

        let body = if selected {
            runner::boxed(body)
        } else {
            runner::boxed(|ctx: TestContext| async move {
                ctx.skip(Some(FILTERED_REASON));
                Ok(())
            })
        };
        self.pending.push((id, body));
        self
    }

    /// Run every declared test and stream the results.
    ///
    /// Resolves once every top-level test has been reported (or the run
    /// bailed out) and the writer has taken the whole stream.
    pub async fn run(self) -> Result<RunReport<W>, HarnessError> {
        scope::install_panic_hook();

        let Harness {
            shared,
            config,
            pending,
            receiver,
            writer,
        } = self;

        let pump = tokio::spawn(receiver.pump(writer));
        let keep_alive = shared.with_tree(|tree| {
            tree.begin();
            tree.keep_alive()
        });

        info!(tests = pending.len(), "starting test run");
        let gate = config
            .concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        for (id, body) in pending {
            runner::spawn(&shared, id, body, gate.clone());
        }

        while !shared.with_tree(|tree| tree.is_done()) {
            keep_alive.notified().await;
        }

        let summary = shared.with_tree(|tree| tree.finish(config.summary));
        let output = pump.await??;

        info!(
            tests = summary.counts.tests,
            failed = summary.counts.failed,
            cancelled = summary.counts.cancelled,
            bailed = summary.bailed,
            "test run finished"
        );
        Ok(RunReport { summary, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{report_unhandled, Attribution, TestExtension};
    use crate::models::{FailureKind, TestStatus};
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> HarnessConfig {
        HarnessConfig {
            summary: false,
            ..HarnessConfig::default()
        }
    }

    fn harness(config: HarnessConfig) -> Harness<Vec<u8>> {
        Harness::new(config, Vec::new())
    }

    async fn run(harness: Harness<Vec<u8>>) -> (RunSummary, String) {
        let report = harness.run().await.unwrap();
        let out = String::from_utf8(report.output).unwrap();
        (report.summary, out)
    }

    /// Replace timing values, which vary between runs
    fn normalize(out: &str) -> String {
        out.lines()
            .map(|line| match line.find("duration_ms: ") {
                Some(pos) => format!("{}duration_ms: *", &line[..pos]),
                None => line.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn test_lines(out: &str) -> Vec<String> {
        out.lines()
            .filter(|line| {
                let line = line.trim_start();
                line.starts_with("ok ") || line.starts_with("not ok ")
            })
            .map(str::to_string)
            .collect()
    }

    fn sleep(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_flat_run_stream() {
        let mut h = harness(config());
        h.test("first", |_| async { Ok(()) })
            .test("second", |_| async { Err(anyhow::anyhow!("boom")) })
            .test("third", |_| async { Ok(()) });

        let (summary, out) = run(h).await;
        let expected = "\
TAP version 13
1..3
ok 1 - first
  ---
  duration_ms: *
  ...
not ok 2 - second
  ---
  duration_ms: *
  error: boom
  failureType: testCodeFailure
  ...
ok 3 - third
  ---
  duration_ms: *
  ...";
        assert_eq!(normalize(&out), expected);
        assert!(!summary.is_success());
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.counts.passed, 2);
        assert_eq!(summary.counts.failed, 1);
    }

    #[tokio::test]
    async fn test_unawaited_subtests_are_cancelled_in_declaration_order() {
        let mut h = harness(config());
        h.test("parent", |ctx| async move {
            let _ = ctx.test("a", |_| async {
                sleep(50).await;
                Ok(())
            });
            let _ = ctx.test("b", |_| async {
                sleep(10).await;
                Ok(())
            });
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert_eq!(
            test_lines(&out),
            vec!["    not ok 1 - a", "    not ok 2 - b", "not ok 1 - parent"]
        );
        assert!(out.contains("    1..2\n"));
        assert!(out.contains("failureType: cancelledByParent"));
        assert!(out.contains("error: 2 subtests failed"));
        assert_eq!(summary.counts.cancelled, 2);
        assert_eq!(summary.results[0].failure_kind, Some(FailureKind::SubtestsFailed));
    }

    #[tokio::test]
    async fn test_awaited_subtests_report_in_declaration_order() {
        let mut h = harness(config());
        h.test("parent", |ctx| async move {
            let a = ctx.test("a", |_| async {
                sleep(50).await;
                Ok(())
            });
            let b = ctx.test("b", |_| async {
                sleep(10).await;
                Ok(())
            });
            let (a, b) = tokio::join!(a, b);
            assert_eq!(a.status, TestStatus::Pass);
            assert_eq!(b.number, 2);
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert_eq!(
            test_lines(&out),
            vec!["    ok 1 - a", "    ok 2 - b", "ok 1 - parent"]
        );
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_skipped_subtest_directive() {
        let mut h = harness(config());
        h.test("parent", |ctx| async move {
            ctx.test("child", |ctx| async move {
                ctx.skip(Some("not ready"));
                Ok(())
            })
            .await;
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert!(out.contains("    ok 1 - child # SKIP not ready\n"));
        assert!(out.contains("ok 1 - parent\n"));
        assert_eq!(summary.counts.skipped, 1);
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_todo_failure_keeps_run_failing() {
        let mut h = harness(config());
        h.test("pending work", |ctx| async move {
            ctx.todo(Some("fix later"));
            Err(anyhow::anyhow!("not implemented"))
        });

        let (summary, out) = run(h).await;
        assert!(out.contains("not ok 1 - pending work # TODO fix later\n"));
        assert_eq!(summary.counts.todo, 1);
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_late_subtest_is_orphaned_to_root() {
        let (tx, rx) = tokio::sync::oneshot::channel::<TestContext>();
        let mut h = harness(config());
        h.test("parent", |ctx| async move {
            let _ = tx.send(ctx);
            Ok(())
        })
        .test("holder", |_| async move {
            let ctx = rx.await?;
            sleep(20).await;
            let late = ctx.test("late", |_| async { Ok(()) }).await;
            assert_eq!(late.failure_kind, Some(FailureKind::ParentAlreadyFinished));
            assert_eq!(late.number, 3);
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert_eq!(
            test_lines(&out),
            vec!["ok 1 - parent", "ok 2 - holder", "not ok 3 - late"]
        );
        assert!(out.contains(
            "error: test could not be started because its parent finished"
        ));
        assert_eq!(summary.counts.failed, 1);
    }

    #[tokio::test]
    async fn test_random_completion_order_is_reported_in_declaration_order() {
        let mut h = harness(config());
        h.test("parent", |ctx| async move {
            let subtests: Vec<_> = (0..10)
                .map(|i| {
                    let delay = rand::rng().random_range(0..30);
                    ctx.test(format!("child {i}"), move |_| async move {
                        sleep(delay).await;
                        Ok(())
                    })
                })
                .collect();
            futures::future::join_all(subtests).await;
            Ok(())
        });
        for i in 0..5 {
            let delay = rand::rng().random_range(0..30);
            h.test(format!("top {i}"), move |_| async move {
                sleep(delay).await;
                Ok(())
            });
        }

        let (summary, out) = run(h).await;
        let mut expected: Vec<String> = (0..10)
            .map(|i| format!("    ok {} - child {i}", i + 1))
            .collect();
        expected.push("ok 1 - parent".to_string());
        expected.extend((0..5).map(|i| format!("ok {} - top {i}", i + 2)));
        assert_eq!(test_lines(&out), expected);
        assert_eq!(summary.counts.tests, 16);
    }

    #[tokio::test]
    async fn test_nested_results_precede_later_siblings() {
        let mut h = harness(config());
        h.test("outer", |ctx| async move {
            ctx.test("inner", |ctx| async move {
                ctx.test("leaf", |_| async {
                    sleep(20).await;
                    Ok(())
                })
                .await;
                Ok(())
            })
            .await;
            Ok(())
        })
        .test("sibling", |_| async { Ok(()) });

        let (_, out) = run(h).await;
        assert_eq!(
            test_lines(&out),
            vec![
                "        ok 1 - leaf",
                "    ok 1 - inner",
                "ok 1 - outer",
                "ok 2 - sibling"
            ]
        );
    }

    #[tokio::test]
    async fn test_detached_failures() {
        let mut h = harness(config());
        h.test("fails while running", |ctx| async move {
            ctx.spawn(async { Err(anyhow::anyhow!("background")) });
            sleep(50).await;
            Ok(())
        })
        .test("leaks", |ctx| async move {
            ctx.spawn(async {
                sleep(20).await;
                Err(anyhow::anyhow!("too late"))
            });
            Ok(())
        })
        .test("keeps the run open", |_| async {
            sleep(80).await;
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert_eq!(
            summary.results[0].failure_kind,
            Some(FailureKind::UnhandledRejection)
        );
        assert_eq!(summary.results[0].message.as_deref(), Some("background"));
        assert_eq!(summary.results[1].status, TestStatus::Pass);
        assert!(out.contains(
            "# Warning: test \"leaks\" generated asynchronous activity after it finished."
        ));
    }

    #[tokio::test]
    async fn test_report_unhandled_inside_body() {
        let mut h = harness(config());
        h.test("reports", |_| async {
            assert_eq!(
                report_unhandled(anyhow::anyhow!("callback error")),
                Attribution::Failed
            );
            Ok(())
        });

        let (summary, _) = run(h).await;
        assert_eq!(
            summary.results[0].failure_kind,
            Some(FailureKind::UnhandledRejection)
        );
    }

    #[tokio::test]
    async fn test_panicking_body_fails() {
        let mut h = harness(config());
        h.test("panics", |_| async {
            if true {
                panic!("exploded");
            }
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert!(out.contains("error: exploded\n"));
        assert!(out.contains("stack: |-"));
        assert_eq!(summary.counts.failed, 1);
    }

    #[tokio::test]
    async fn test_body_panicking_before_returning_its_future_fails() {
        let mut h = harness(HarnessConfig {
            timeout_ms: Some(50),
            ..config()
        });
        h.test("first", |_| async { Ok(()) })
            .test("second", |_| -> std::future::Ready<anyhow::Result<()>> {
                panic!("boom")
            })
            .test("third", |_| async { Ok(()) });

        let (summary, out) = tokio::time::timeout(Duration::from_secs(5), run(h))
            .await
            .expect("run finished");
        assert_eq!(
            test_lines(&out),
            vec!["ok 1 - first", "not ok 2 - second", "ok 3 - third"]
        );
        assert!(out.contains("error: boom\n"));
        assert_eq!(
            summary.results[1].failure_kind,
            Some(FailureKind::TestCodeFailure)
        );
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_skipped_test_with_failing_body_reads_ok() {
        let mut h = harness(config());
        h.test("parent", |ctx| async move {
            ctx.test("s", |ctx| async move {
                ctx.skip(Some("not ready"));
                Err(anyhow::anyhow!("x"))
            })
            .await;
            Ok(())
        });

        let (summary, out) = run(h).await;
        assert!(out.contains("    ok 1 - s # SKIP not ready\n"));
        assert!(!out.contains("not ok"));
        assert!(out.contains("ok 1 - parent\n"));
        assert_eq!(summary.counts.skipped, 1);
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut h = harness(HarnessConfig {
            timeout_ms: Some(20),
            ..config()
        });
        h.test("hangs", |_| std::future::pending());

        let (summary, out) = run(h).await;
        assert!(out.contains("error: test timed out after 20ms"));
        assert_eq!(
            summary.results[0].failure_kind,
            Some(FailureKind::TestTimeoutFailure)
        );
    }

    #[tokio::test]
    async fn test_bail_on_failure_terminates_stream() {
        let mut h = harness(HarnessConfig {
            bail_on_failure: true,
            ..config()
        });
        h.test("broken", |_| async { Err(anyhow::anyhow!("nope")) })
            .test("slow", |_| async {
                sleep(5_000).await;
                Ok(())
            });

        let (summary, out) = run(h).await;
        assert!(summary.bailed);
        assert!(!summary.is_success());
        assert!(out.ends_with("Bail out! broken failed\n"));
        assert!(!out.contains("slow"));
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut h = harness(HarnessConfig {
            concurrency: Some(2),
            ..config()
        });
        for i in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            h.test(format!("t{i}"), move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(10).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let (summary, _) = run(h).await;
        assert!(summary.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_name_filter_skips_others() {
        let mut h = harness(HarnessConfig {
            name_filter: Some("parser".to_string()),
            ..config()
        });
        h.test("parser handles input", |_| async { Ok(()) })
            .test("network", |_| async { Err(anyhow::anyhow!("unreachable")) });

        let (summary, out) = run(h).await;
        assert!(out.contains("ok 1 - parser handles input\n"));
        assert!(out.contains("ok 2 - network # SKIP test name does not match filter\n"));
        assert!(summary.is_success());
    }

    struct Interceptor(Arc<Mutex<Vec<String>>>);

    impl TestExtension for Interceptor {
        fn reset(&mut self) {
            self.0.lock().unwrap().push("reset".to_string());
        }
    }

    #[tokio::test]
    async fn test_extensions_reset_at_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        let mut h = harness(config());
        h.test("mocks", move |ctx| async move {
            ctx.install(Interceptor(seen.clone()));
            let installed = ctx.with_extension(|ext: &mut Interceptor| {
                ext.0.lock().unwrap().push("used".to_string());
            });
            assert!(installed.is_some());
            ctx.diagnostic(format!("running {}", ctx.name()));
            Ok(())
        });

        let (_, out) = run(h).await;
        assert_eq!(*log.lock().unwrap(), vec!["used", "reset"]);
        assert!(out.contains("# running mocks\n"));
    }

    #[tokio::test]
    async fn test_summary_diagnostics() {
        let mut h = harness(HarnessConfig::default());
        h.test("one", |_| async { Ok(()) });

        let (_, out) = run(h).await;
        for line in ["# tests 1\n", "# pass 1\n", "# fail 0\n", "# todo 0\n"] {
            assert!(out.contains(line), "missing {line:?}");
        }
    }

    #[test]
    fn test_try_new_rejects_zero_concurrency() {
        let result = Harness::try_new(
            HarnessConfig {
                concurrency: Some(0),
                ..config()
            },
            Vec::new(),
        );
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_run() {
        let (summary, out) = run(harness(config())).await;
        assert_eq!(out, "TAP version 13\n1..0\n");
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_small_sink_keeps_order() {
        let mut h = harness(HarnessConfig {
            sink_capacity: 1,
            ..config()
        });
        for i in 0..20 {
            h.test(format!("t{i}"), |_| async { Ok(()) });
        }

        let (_, out) = run(h).await;
        let expected: Vec<_> = (0..20).map(|i| format!("ok {} - t{i}", i + 1)).collect();
        assert_eq!(test_lines(&out), expected);
    }
}
