//! Test execution engine
//!
//! Runs a tree of concurrently executing tests and reports their results in
//! declaration order.

mod context;
mod extension;
mod harness;
mod runner;
mod scope;
mod tree;

pub use context::{Subtest, TestContext};
pub use extension::{Extensions, TestExtension};
pub use harness::{Harness, RunReport};
pub use scope::{report_uncaught, report_unhandled, ScopeToken};
pub use tree::Attribution;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tree::Tree;

/// State shared by the root and every running test
#[derive(Debug)]
pub(crate) struct Shared {
    tree: Mutex<Tree>,
    timeout: Option<Duration>,
}

impl Shared {
    fn new(tree: Tree, timeout: Option<Duration>) -> Self {
        Self {
            tree: Mutex::new(tree),
            timeout,
        }
    }

    /// Run `f` with the tree locked. Extensions of nodes torn down by `f`
    /// are reset after the lock is released.
    pub(crate) fn with_tree<R>(&self, f: impl FnOnce(&mut Tree) -> R) -> R {
        let (result, resets) = {
            let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut tree);
            (result, tree.take_pending_resets())
        };

        for extensions in resets {
            extensions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset_all();
        }

        result
    }
}
