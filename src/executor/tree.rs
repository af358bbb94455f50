//! Test tree and reporting protocol
//!
//! Every test node lives in one arena owned by [`Tree`]. Parents own their
//! children through an ordered list of ids (declaration order); children refer
//! back to their parent by id only.
//!
//! A node moves through `pending -> running -> settled -> torn down ->
//! reported`. Settling happens once; teardown cancels unfinished children and
//! registers the node as ready with its parent; reporting happens when every
//! earlier sibling has been reported and the parent is itself clear to send.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::extension::Extensions;
use super::scope::ScopeToken;
use crate::models::{
    FailureKind, RunSummary, TestCounts, TestFailure, TestOutcome, TestStatus,
};
use crate::output::formatter::indent;
use crate::output::{Directive, LineStatus, TapReporter};

pub(crate) type NodeId = usize;

/// The root node always sits at index 0
pub(crate) const ROOT: NodeId = 0;

#[derive(Debug)]
pub(crate) struct Node {
    name: String,
    number: usize,
    nesting: usize,
    parent: Option<NodeId>,
    subtests: Vec<NodeId>,

    start: Option<Instant>,
    end: Option<Instant>,
    passed: bool,
    error: Option<TestFailure>,
    skip: Option<Option<String>>,
    todo: Option<Option<String>>,
    cancelled: bool,
    diagnostics: Vec<String>,
    nested_output: Option<String>,

    /// Number of the next child to report
    waiting_on: usize,
    /// Torn-down children waiting for their turn, keyed by number
    ready: BTreeMap<usize, NodeId>,
    torn_down: bool,
    reported: bool,

    task: Option<AbortHandle>,
    extensions: Option<Arc<Mutex<Extensions>>>,
}

impl Node {
    fn new(name: String, number: usize, nesting: usize, parent: Option<NodeId>) -> Self {
        Self {
            name,
            number,
            nesting,
            parent,
            subtests: Vec::new(),
            start: None,
            end: None,
            passed: false,
            error: None,
            skip: None,
            todo: None,
            cancelled: false,
            diagnostics: Vec::new(),
            nested_output: None,
            waiting_on: 1,
            ready: BTreeMap::new(),
            torn_down: false,
            reported: false,
            task: None,
            extensions: None,
        }
    }

    fn duration_ms(&self) -> f64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start).as_secs_f64() * 1000.0,
            _ => 0.0,
        }
    }

    fn directive(&self) -> Option<Directive> {
        if let Some(reason) = &self.skip {
            Some(Directive::Skip(reason.clone()))
        } else {
            self.todo.as_ref().map(|reason| Directive::Todo(reason.clone()))
        }
    }

    fn status(&self) -> TestStatus {
        if self.skip.is_some() {
            TestStatus::Skip
        } else if self.passed {
            TestStatus::Pass
        } else if self.cancelled {
            TestStatus::Cancelled
        } else {
            TestStatus::Fail
        }
    }
}

/// Result of declaring a subtest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Declared {
    /// Attached to the requested parent, ready to be started
    Pending(NodeId),
    /// The parent had already finished; attached to the root and failed
    Orphaned(NodeId),
}

/// What happened to an error raised through the out-of-band channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attribution {
    /// The owning test was still running and now fails with the error
    Failed,
    /// The owning test had already settled; a warning was added to the root
    Leaked,
    /// No test owns the current execution scope
    Unattributed,
}

#[derive(Debug)]
pub(crate) struct Tree {
    nodes: Vec<Node>,
    reporter: TapReporter,
    scopes: HashMap<ScopeToken, NodeId>,
    counts: TestCounts,
    keep_alive: Arc<Notify>,
    bail_on_failure: bool,
    pending_resets: Vec<Arc<Mutex<Extensions>>>,
}

impl Tree {
    pub fn new(reporter: TapReporter, bail_on_failure: bool) -> Self {
        Self {
            nodes: vec![Node::new("<root>".to_string(), 0, 0, None)],
            reporter,
            scopes: HashMap::new(),
            counts: TestCounts::default(),
            keep_alive: Arc::new(Notify::new()),
            bail_on_failure,
            pending_resets: Vec::new(),
        }
    }

    pub fn keep_alive(&self) -> Arc<Notify> {
        self.keep_alive.clone()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    pub fn number(&self, id: NodeId) -> usize {
        self.nodes[id].number
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn is_settled(&self, id: NodeId) -> bool {
        self.nodes[id].end.is_some()
    }

    /// Create a child of `parent`. A parent that has already settled cannot
    /// take new children: the subtest is attached to the root instead and
    /// fails immediately.
    pub fn declare(&mut self, parent: NodeId, name: String) -> Declared {
        let orphaned = parent != ROOT && self.nodes[parent].end.is_some();
        let parent = if orphaned { ROOT } else { parent };

        let id = self.nodes.len();
        let number = self.nodes[parent].subtests.len() + 1;
        let nesting = if parent == ROOT {
            0
        } else {
            self.nodes[parent].nesting + 1
        };

        debug!(test = %name, number, nesting, orphaned, "declared test");
        self.nodes.push(Node::new(name, number, nesting, Some(parent)));
        self.nodes[parent].subtests.push(id);

        if !orphaned {
            return Declared::Pending(id);
        }

        let now = Instant::now();
        self.nodes[id].start = Some(now);
        self.settle(id, Err(TestFailure::parent_already_finished()));
        self.teardown(id);
        self.process_ready(ROOT, false);
        Declared::Orphaned(id)
    }

    pub fn set_task(&mut self, id: NodeId, task: AbortHandle) {
        let node = &mut self.nodes[id];
        if node.end.is_some() && node.cancelled {
            task.abort();
        }
        node.task = Some(task);
    }

    pub fn set_extensions(&mut self, id: NodeId, extensions: Arc<Mutex<Extensions>>) {
        self.nodes[id].extensions = Some(extensions);
    }

    /// Mark a node as running inside `scope`
    pub fn start(&mut self, id: NodeId, scope: ScopeToken) {
        self.nodes[id].start = Some(Instant::now());
        self.scopes.insert(scope, id);
        debug!(test = %self.nodes[id].name, "started");
    }

    /// Fix a node's outcome. Only the first call has any effect.
    pub fn settle(&mut self, id: NodeId, result: Result<(), TestFailure>) -> bool {
        let node = &mut self.nodes[id];
        if node.end.is_some() {
            return false;
        }

        node.end = Some(Instant::now());
        match result {
            Ok(()) => node.passed = true,
            Err(failure) => {
                debug!(test = %node.name, kind = %failure.kind, "failed");
                node.passed = false;
                node.error = Some(failure);
            }
        }
        true
    }

    fn cancel(&mut self, id: NodeId) {
        if self.settle(id, Err(TestFailure::cancelled_by_parent())) {
            let node = &mut self.nodes[id];
            node.cancelled = true;
            if let Some(task) = &node.task {
                task.abort();
            }
            debug!(test = %node.name, "cancelled by parent");
        }
    }

    pub fn skip(&mut self, id: NodeId, reason: Option<String>) {
        let node = &mut self.nodes[id];
        if node.end.is_none() {
            node.skip = Some(reason);
        }
    }

    pub fn todo(&mut self, id: NodeId, reason: Option<String>) {
        let node = &mut self.nodes[id];
        if node.end.is_none() {
            node.todo = Some(reason);
        }
    }

    pub fn diagnostic(&mut self, id: NodeId, message: String) {
        if self.nodes[id].reported {
            warn!(test = %self.nodes[id].name, "diagnostic added after the test was reported");
            let message = format!(
                "Warning: diagnostic from test \"{}\" arrived after it was reported: {message}",
                self.nodes[id].name
            );
            self.nodes[ROOT].diagnostics.push(message);
        } else {
            self.nodes[id].diagnostics.push(message);
        }
    }

    pub fn nest_output(&mut self, id: NodeId, output: String) {
        self.nodes[id]
            .nested_output
            .get_or_insert_with(String::new)
            .push_str(&output);
    }

    fn counts_as_failure(&self, id: NodeId) -> bool {
        self.nodes[id].status().is_failure()
    }

    /// Cancel unfinished children, fold child failures into this node and
    /// register it as ready with its parent.
    pub fn teardown(&mut self, id: NodeId) {
        if self.nodes[id].torn_down {
            return;
        }
        self.nodes[id].torn_down = true;

        let children = self.nodes[id].subtests.clone();
        for &child in &children {
            if self.nodes[child].end.is_none() {
                self.cancel(child);
            }
            self.teardown(child);
        }

        let failed = children
            .iter()
            .filter(|&&child| self.counts_as_failure(child))
            .count();

        let node = &mut self.nodes[id];
        if node.passed && failed > 0 {
            node.passed = false;
            node.error = Some(TestFailure::subtests_failed(failed));
        }

        let (parent, number) = (node.parent, node.number);
        if let Some(extensions) = node.extensions.take() {
            self.pending_resets.push(extensions);
        }

        if let Some(parent) = parent {
            self.nodes[parent].ready.insert(number, id);
        }
    }

    /// Extensions of torn-down nodes, to be reset outside the tree lock
    pub fn take_pending_resets(&mut self) -> Vec<Arc<Mutex<Extensions>>> {
        std::mem::take(&mut self.pending_resets)
    }

    /// A node may write to the stream when every ancestor is waiting on the
    /// branch that leads to it.
    fn is_clear_to_send(&self, id: NodeId) -> bool {
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            if self.nodes[parent].waiting_on != self.nodes[current].number {
                return false;
            }
            current = parent;
        }
        true
    }

    /// Report the contiguous run of ready children starting at the one the
    /// node is waiting on.
    pub fn process_ready(&mut self, id: NodeId, can_force: bool) {
        let mut clear = None;

        loop {
            let next = self.nodes[id].waiting_on;
            let Some(&child) = self.nodes[id].ready.get(&next) else {
                break;
            };

            if !can_force && !*clear.get_or_insert_with(|| self.is_clear_to_send(id)) {
                break;
            }

            self.nodes[id].ready.remove(&next);
            self.finalize(child);
        }
    }

    fn finalize(&mut self, id: NodeId) {
        self.process_ready(id, true);

        let node = &self.nodes[id];
        let own_indent = indent(node.nesting);

        if !node.subtests.is_empty() {
            self.reporter
                .plan(&indent(node.nesting + 1), node.subtests.len());
        }

        if let Some(output) = &node.nested_output {
            self.reporter.nested(&own_indent, output);
        }

        // A skipped node reads as ok even when its body failed
        let status = node.status();
        let description = format!("- {}", node.name);
        let directive = node.directive();
        self.reporter.test_point(
            &own_indent,
            LineStatus::from_passed(!status.is_failure()),
            node.number,
            &description,
            directive.as_ref(),
        );
        self.reporter
            .details(&own_indent, node.duration_ms(), node.error.as_ref());
        for message in &node.diagnostics {
            self.reporter.diagnostic(&own_indent, message);
        }

        let todo = node.todo.is_some();
        let parent = node.parent.unwrap_or(ROOT);
        debug!(test = %node.name, %status, "reported");

        self.nodes[id].reported = true;
        self.counts.record(status, todo);
        self.nodes[parent].waiting_on += 1;

        if parent == ROOT {
            if self.bail_on_failure && status.is_failure() {
                let reason = format!("{} failed", self.nodes[id].name);
                self.reporter.bail(Some(&reason));
                self.keep_alive.notify_one();
            }
            if self.nodes[ROOT].waiting_on > self.nodes[ROOT].subtests.len() {
                self.keep_alive.notify_one();
            }
        }
    }

    /// Route an out-of-band error to the node running in `scope`
    pub fn out_of_band(
        &mut self,
        scope: ScopeToken,
        kind: FailureKind,
        error: anyhow::Error,
    ) -> Attribution {
        let Some(&id) = self.scopes.get(&scope) else {
            warn!(%kind, "unattributed error: {error:#}");
            return Attribution::Unattributed;
        };

        if self.nodes[id].end.is_none() {
            self.settle(id, Err(TestFailure::out_of_band(kind, error)));
            return Attribution::Failed;
        }

        let name = &self.nodes[id].name;
        warn!(test = %name, %kind, "asynchronous activity after the test finished");
        let message = format!(
            "Warning: test \"{name}\" generated asynchronous activity after it finished. \
             The activity raised an {kind} event: {error:#}"
        );
        self.nodes[ROOT].diagnostics.push(message);
        Attribution::Leaked
    }

    pub fn outcome(&self, id: NodeId) -> TestOutcome {
        let node = &self.nodes[id];
        TestOutcome {
            name: node.name.clone(),
            number: node.number,
            status: node.status(),
            todo: node.todo.is_some(),
            duration_ms: node.duration_ms(),
            message: node.error.as_ref().map(|e| e.error_message()),
            failure_kind: node.error.as_ref().map(|e| e.kind),
        }
    }

    /// Start the stream: version preamble and the plan for top-level tests
    pub fn begin(&mut self) {
        self.nodes[ROOT].start = Some(Instant::now());
        self.reporter.version();
        self.reporter.plan("", self.nodes[ROOT].subtests.len());
    }

    /// Every top-level test has been reported, or the stream bailed out
    pub fn is_done(&self) -> bool {
        self.reporter.is_bailed() || self.nodes[ROOT].waiting_on > self.nodes[ROOT].subtests.len()
    }

    /// Abort every test task that has not settled yet
    fn abort_outstanding(&mut self) {
        for node in self.nodes.iter_mut().filter(|n| n.end.is_none()) {
            if let Some(task) = &node.task {
                task.abort();
            }
        }
    }

    /// Write the root epilogue, close the stream and summarize the run
    pub fn finish(&mut self, summary_diagnostics: bool) -> RunSummary {
        self.abort_outstanding();

        let root = &mut self.nodes[ROOT];
        root.end.get_or_insert_with(Instant::now);
        let duration_ms = root.duration_ms();

        for message in &self.nodes[ROOT].diagnostics {
            self.reporter.diagnostic("", message);
        }

        if summary_diagnostics {
            let counts = self.counts;
            for (label, value) in [
                ("tests", counts.tests),
                ("pass", counts.passed),
                ("fail", counts.failed),
                ("cancelled", counts.cancelled),
                ("skipped", counts.skipped),
                ("todo", counts.todo),
            ] {
                self.reporter.diagnostic("", &format!("{label} {value}"));
            }
            self.reporter
                .diagnostic("", &format!("duration_ms {duration_ms}"));
        }

        self.reporter.close();

        let results = self.nodes[ROOT]
            .subtests
            .iter()
            .map(|&id| self.outcome(id))
            .collect();

        RunSummary {
            counts: self.counts,
            duration_ms,
            bailed: self.reporter.is_bailed(),
            results,
        }
    }
}
