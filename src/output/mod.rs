//! Result stream output
//!
//! Formatting of TAP records, the event API used by the executor and the
//! flow-controlled sink underneath it.

pub mod formatter;
mod reporter;
pub mod sink;

pub use formatter::{Directive, LineStatus};
pub use reporter::TapReporter;
pub use sink::{ResultSink, SinkReceiver};
