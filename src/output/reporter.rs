//! Result-stream event API
//!
//! Turns report events into formatted records and hands them to the sink.
//! Once a bail-out has been written the stream is terminated and every later
//! event is ignored.

use tracing::warn;

use super::formatter::{self, Directive, LineStatus};
use super::sink::ResultSink;
use crate::models::TestFailure;

#[derive(Debug)]
pub struct TapReporter {
    sink: ResultSink,
    bailed: bool,
}

impl TapReporter {
    pub fn new(sink: ResultSink) -> Self {
        Self {
            sink,
            bailed: false,
        }
    }

    pub fn is_bailed(&self) -> bool {
        self.bailed
    }

    fn push(&self, record: String) {
        if !self.bailed {
            self.sink.write(record);
        }
    }

    pub fn version(&self) {
        self.push(formatter::version());
    }

    pub fn plan(&self, indent: &str, count: usize) {
        self.push(formatter::plan(indent, count, None));
    }

    pub fn test_point(
        &self,
        indent: &str,
        status: LineStatus,
        number: usize,
        description: &str,
        directive: Option<&Directive>,
    ) {
        self.push(formatter::test_line(
            indent,
            status,
            number,
            Some(description),
            directive,
        ));
    }

    pub fn ok(&self, indent: &str, number: usize, description: &str, directive: Option<&Directive>) {
        self.test_point(indent, LineStatus::Ok, number, description, directive);
    }

    pub fn fail(&self, indent: &str, number: usize, description: &str, directive: Option<&Directive>) {
        self.test_point(indent, LineStatus::NotOk, number, description, directive);
    }

    pub fn details(&self, indent: &str, duration_ms: f64, failure: Option<&TestFailure>) {
        self.push(formatter::details(indent, duration_ms, failure));
    }

    pub fn diagnostic(&self, indent: &str, message: &str) {
        self.push(formatter::diagnostic(indent, message));
    }

    /// Foreign result stream nested under the next test line
    pub fn nested(&self, indent: &str, output: &str) {
        let nested = formatter::nested_output(indent, output);
        if !nested.is_empty() {
            self.push(nested);
        }
    }

    /// Write a bail-out line and terminate the stream
    pub fn bail(&mut self, message: Option<&str>) {
        if self.bailed {
            return;
        }
        warn!("bailing out: {}", message.unwrap_or("no reason given"));
        self.sink.write(formatter::bail(message));
        self.bailed = true;
        self.sink.close();
    }

    pub fn close(&self) {
        self.sink.close();
    }
}
