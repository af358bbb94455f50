//! Execution of a single test node
//!
//! A node runs as its own tokio task: start, await the body inside the
//! node's scope, settle, yield once so concurrently finishing siblings get a
//! turn, then tear down and let the parent report whatever became ready.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::context::TestContext;
use super::extension::Extensions;
use super::scope::{self, ActiveScope, ScopeToken};
use super::tree::NodeId;
use super::Shared;
use crate::models::TestFailure;

/// Type-erased test body
pub(crate) type Body = Box<dyn FnOnce(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) fn boxed<F, Fut>(body: F) -> Body
where
    F: FnOnce(TestContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    // The closure runs on first poll, inside the body's unwind guard
    Box::new(move |ctx| Box::pin(async move { body(ctx).await }))
}

/// Settles and reports a node whose task unwinds without finishing
struct Unwound {
    shared: Arc<Shared>,
    id: NodeId,
}

impl Drop for Unwound {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let id = self.id;
        warn!(node = id, "test task unwound before settling");
        self.shared.with_tree(|tree| {
            tree.settle(
                id,
                Err(TestFailure::test_code(anyhow::anyhow!(
                    "test task panicked outside its body"
                ))),
            );
            tree.teardown(id);
            if let Some(parent) = tree.parent(id) {
                tree.process_ready(parent, false);
            }
        });
    }
}

/// Start running a declared node. `gate` bounds how many gated nodes run at
/// once.
pub(crate) fn spawn(
    shared: &Arc<Shared>,
    id: NodeId,
    body: Body,
    gate: Option<Arc<Semaphore>>,
) -> JoinHandle<()> {
    let task = tokio::spawn(run(shared.clone(), id, body, gate));
    shared.with_tree(|tree| tree.set_task(id, task.abort_handle()));
    task
}

async fn run(shared: Arc<Shared>, id: NodeId, body: Body, gate: Option<Arc<Semaphore>>) {
    let _permit = match gate {
        Some(gate) => gate.acquire_owned().await.ok(),
        None => None,
    };

    let token = ScopeToken::next();
    let extensions = Arc::new(Mutex::new(Extensions::default()));
    let started = shared.with_tree(|tree| {
        if tree.is_settled(id) {
            return false;
        }
        tree.start(id, token);
        tree.set_extensions(id, extensions.clone());
        true
    });
    if !started {
        debug!(node = id, "settled before it could start");
        return;
    }

    let _unwound = Unwound {
        shared: shared.clone(),
        id,
    };
    let ctx = TestContext::new(shared.clone(), id, token, extensions);
    let scope = ActiveScope::new(token, Arc::downgrade(&shared));
    let result = scope::run_body(scope, body(ctx), shared.timeout).await;

    shared.with_tree(|tree| tree.settle(id, result));
    tokio::task::yield_now().await;

    shared.with_tree(|tree| {
        tree.teardown(id);
        if let Some(parent) = tree.parent(id) {
            tree.process_ready(parent, false);
        }
    });
}
