//! Handle given to every running test body
//!
//! The context is how a body declares subtests, adds diagnostics, marks
//! itself skipped or todo, starts detached work inside its scope and attaches
//! extensions.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use tokio::task::JoinHandle;

use super::extension::{Extensions, TestExtension};
use super::runner;
use super::scope::{self, ActiveScope, ScopeToken};
use super::tree::{Declared, NodeId};
use super::Shared;
use crate::models::TestOutcome;

#[derive(Clone)]
pub struct TestContext {
    shared: Arc<Shared>,
    id: NodeId,
    scope: ScopeToken,
    extensions: Arc<Mutex<Extensions>>,
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("node", &self.id)
            .field("scope", &self.scope)
            .finish()
    }
}

impl TestContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: NodeId,
        scope: ScopeToken,
        extensions: Arc<Mutex<Extensions>>,
    ) -> Self {
        Self {
            shared,
            id,
            scope,
            extensions,
        }
    }

    pub fn name(&self) -> String {
        self.shared.with_tree(|tree| tree.name(self.id).to_string())
    }

    /// Declare and start a subtest.
    ///
    /// The subtest runs concurrently with the caller. Awaiting the returned
    /// [`Subtest`] waits for it to finish; a subtest still running when this
    /// test finishes is cancelled. Declaring a subtest after this test has
    /// finished attaches it to the root as an immediate failure.
    pub fn test<F, Fut>(&self, name: impl Into<String>, body: F) -> Subtest
    where
        F: FnOnce(TestContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let declared = self.shared.with_tree(|tree| tree.declare(self.id, name));

        match declared {
            Declared::Pending(id) => Subtest {
                shared: self.shared.clone(),
                id,
                handle: Some(runner::spawn(&self.shared, id, runner::boxed(body), None)),
            },
            Declared::Orphaned(id) => Subtest {
                shared: self.shared.clone(),
                id,
                handle: None,
            },
        }
    }

    /// Attach a diagnostic line, reported after this test's details
    pub fn diagnostic(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.with_tree(|tree| tree.diagnostic(self.id, message));
    }

    pub fn skip(&self, reason: Option<&str>) {
        let reason = reason.map(str::to_string);
        self.shared.with_tree(|tree| tree.skip(self.id, reason));
    }

    pub fn todo(&self, reason: Option<&str>) {
        let reason = reason.map(str::to_string);
        self.shared.with_tree(|tree| tree.todo(self.id, reason));
    }

    /// Run `fut` as detached work owned by this test. An error it returns or
    /// a panic it raises fails this test if it is still running.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let scope = ActiveScope::new(self.scope, Arc::downgrade(&self.shared));
        tokio::spawn(scope::in_scope(scope, scope::run_detached(fut)))
    }

    /// Nest a foreign result stream under this test's line
    pub fn embed_output(&self, output: &str) {
        let output = output.to_string();
        self.shared.with_tree(|tree| tree.nest_output(self.id, output));
    }

    /// Attach an extension, reset when this test is torn down
    pub fn install<T: TestExtension>(&self, ext: T) {
        self.extensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ext);
    }

    /// Run `f` against the installed extension of type `T`. `f` must not
    /// touch this context's extensions itself.
    pub fn with_extension<T: TestExtension, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut extensions = self.extensions.lock().unwrap_or_else(PoisonError::into_inner);
        extensions.get_mut::<T>().map(f)
    }
}

/// A declared subtest. Resolves to its outcome once it has finished.
#[must_use = "a subtest that is not awaited is cancelled when its parent finishes"]
pub struct Subtest {
    shared: Arc<Shared>,
    id: NodeId,
    handle: Option<JoinHandle<()>>,
}

impl Subtest {
    /// Sequence number within the parent
    pub fn number(&self) -> usize {
        self.shared.with_tree(|tree| tree.number(self.id))
    }
}

impl fmt::Debug for Subtest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtest").field("node", &self.id).finish()
    }
}

impl Future for Subtest {
    type Output = TestOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(handle) = self.handle.as_mut() {
            // An aborted task still leaves a settled node behind
            let _ = ready!(Pin::new(handle).poll(cx));
            self.handle = None;
        }
        let id = self.id;
        Poll::Ready(self.shared.with_tree(|tree| tree.outcome(id)))
    }
}
