//! Execution scopes and the out-of-band failure channel
//!
//! Every running test body is polled inside a task-local scope. The scope
//! token is mapped to the owning node by the tree, so errors raised by
//! detached work can be attributed to the test that started it.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Once, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::tree::Attribution;
use super::Shared;
use crate::models::{FailureKind, TestFailure};

/// Opaque identifier of one execution of a test body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeToken(u64);

impl ScopeToken {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ScopeToken(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub(crate) struct ActiveScope {
    token: ScopeToken,
    harness: Weak<Shared>,
}

impl ActiveScope {
    pub(crate) fn new(token: ScopeToken, harness: Weak<Shared>) -> Self {
        Self { token, harness }
    }
}

tokio::task_local! {
    static CURRENT_SCOPE: ActiveScope;
}

/// Run `fut` with `scope` as the current execution scope
pub(crate) fn in_scope<F: Future>(
    scope: ActiveScope,
    fut: F,
) -> tokio::task::futures::TaskLocalFuture<ActiveScope, F> {
    CURRENT_SCOPE.scope(scope, fut)
}

struct PanicRecord {
    location: Option<String>,
    backtrace: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicRecord>> = const { RefCell::new(None) };
}

/// Install the process-wide panic hook. Panics raised inside a test scope
/// are recorded for the failure report instead of being printed; everything
/// else goes to the previous hook.
pub(crate) fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CURRENT_SCOPE.try_with(|_| ()).is_err() {
                previous(info);
                return;
            }

            let backtrace = Backtrace::capture();
            let record = PanicRecord {
                location: info.location().map(|l| l.to_string()),
                backtrace: (backtrace.status() == BacktraceStatus::Captured)
                    .then(|| backtrace.to_string()),
            };
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(record));
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}

/// Build the failure for a panic caught in a test body, attaching the
/// location and backtrace recorded by the hook when available.
fn panic_failure(payload: Box<dyn Any + Send>) -> TestFailure {
    let message = panic_message(payload.as_ref());
    let record = LAST_PANIC.with(|last| last.borrow_mut().take());
    let failure = TestFailure::test_code(anyhow::anyhow!(message.clone()));

    let Some(PanicRecord {
        location,
        backtrace,
    }) = record
    else {
        return failure;
    };

    let mut stack = message;
    if let Some(location) = location {
        stack.push_str(&format!("\n    at {location}"));
    }
    if let Some(backtrace) = backtrace {
        stack.push('\n');
        stack.push_str(&backtrace);
    }
    failure.with_stack(stack)
}

/// Await a test body inside its scope, turning errors, panics and timeouts
/// into failures.
pub(crate) async fn run_body(
    scope: ActiveScope,
    body: BoxFuture<'static, anyhow::Result<()>>,
    timeout: Option<Duration>,
) -> Result<(), TestFailure> {
    let guarded = in_scope(scope, AssertUnwindSafe(body).catch_unwind());

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(TestFailure::timed_out(limit.as_millis())),
        },
        None => guarded.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(TestFailure::test_code(error)),
        Err(payload) => Err(panic_failure(payload)),
    }
}

/// Await detached work started by a test. Errors and panics are reported
/// through the out-of-band channel of the enclosing scope.
pub(crate) async fn run_detached<F>(fut: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            report_unhandled(error);
        }
        Err(payload) => {
            LAST_PANIC.with(|last| last.borrow_mut().take());
            report_uncaught(anyhow::anyhow!(panic_message(payload.as_ref())));
        }
    }
}

fn report(kind: FailureKind, error: anyhow::Error) -> Attribution {
    let scope = CURRENT_SCOPE.try_with(|scope| scope.clone()).ok();
    let Some(scope) = scope else {
        tracing::warn!(%kind, "error raised outside any test: {error:#}");
        return Attribution::Unattributed;
    };
    let Some(harness) = scope.harness.upgrade() else {
        return Attribution::Unattributed;
    };
    harness.with_tree(|tree| tree.out_of_band(scope.token, kind, error))
}

/// Report a panic-like failure from work running on behalf of the current
/// test. If the test has already settled, the error becomes a warning on
/// the root of the result stream.
pub fn report_uncaught(error: anyhow::Error) -> Attribution {
    report(FailureKind::UncaughtException, error)
}

/// Report an error returned by work nobody awaited, on behalf of the
/// current test.
pub fn report_unhandled(error: anyhow::Error) -> Attribution {
    report(FailureKind::UnhandledRejection, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body<F>(fut: F) -> BoxFuture<'static, anyhow::Result<()>>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Box::pin(fut)
    }

    #[test]
    fn test_scope_tokens_are_unique() {
        let a = ScopeToken::next();
        let b = ScopeToken::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static str"), "static str");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u32), "test panicked");
    }

    #[test]
    fn test_report_outside_scope_is_unattributed() {
        assert_eq!(
            report_uncaught(anyhow::anyhow!("stray")),
            Attribution::Unattributed
        );
    }

    #[tokio::test]
    async fn test_run_body_outcomes() {
        install_panic_hook();
        let scope = || ActiveScope::new(ScopeToken::next(), Weak::new());

        assert!(run_body(scope(), body(async { Ok(()) }), None).await.is_ok());

        let err = run_body(scope(), body(async { Err(anyhow::anyhow!("boom")) }), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_message(), "boom");

        let err = run_body(
            scope(),
            body(async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            }),
            None,
        )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::TestCodeFailure);
        assert_eq!(err.error_message(), "kaboom");
        assert!(err.stack().is_some_and(|s| s.starts_with("kaboom\n    at ")));

        let err = run_body(
            scope(),
            body(std::future::pending()),
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, FailureKind::TestTimeoutFailure);
        assert_eq!(err.error_message(), "test timed out after 10ms");
    }
}
