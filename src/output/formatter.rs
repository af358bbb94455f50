//! TAP record formatting
//!
//! Pure functions producing result-stream fragments. Every fragment ends with
//! a newline so it can be written to the sink as one record.

use std::fmt;

use crate::models::TestFailure;

/// One level of indentation
pub const INDENT: &str = "    ";

/// TAP version announced by the preamble
pub const TAP_VERSION: u32 = 13;

/// Indentation string for a nesting level
pub fn indent(nesting: usize) -> String {
    INDENT.repeat(nesting)
}

/// Status word of a test line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    NotOk,
}

impl LineStatus {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            LineStatus::Ok
        } else {
            LineStatus::NotOk
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Ok => "ok",
            LineStatus::NotOk => "not ok",
        }
    }
}

/// Advisory annotation on a test line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Skip(Option<String>),
    Todo(Option<String>),
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (word, reason) = match self {
            Directive::Skip(reason) => ("SKIP", reason),
            Directive::Todo(reason) => ("TODO", reason),
        };
        f.write_str(word)?;
        match reason {
            Some(reason) if !reason.is_empty() => write!(f, " {reason}"),
            _ => Ok(()),
        }
    }
}

pub fn version() -> String {
    format!("TAP version {TAP_VERSION}\n")
}

pub fn plan(indent: &str, count: usize, explanation: Option<&str>) -> String {
    match explanation {
        Some(exp) if !exp.is_empty() => format!("{indent}1..{count} # {exp}\n"),
        _ => format!("{indent}1..{count}\n"),
    }
}

pub fn test_line(
    indent: &str,
    status: LineStatus,
    number: usize,
    description: Option<&str>,
    directive: Option<&Directive>,
) -> String {
    let mut line = format!("{indent}{} {number}", status.as_str());

    if let Some(description) = description.filter(|d| !d.is_empty()) {
        line.push(' ');
        line.push_str(description);
    }

    if let Some(directive) = directive {
        line.push_str(&format!(" # {directive}"));
    }

    line.push('\n');
    line
}

/// YAML-ish details block following a test line
pub fn details(indent: &str, duration_ms: f64, failure: Option<&TestFailure>) -> String {
    let mut out = format!("{indent}  ---\n");
    out.push_str(&format!("{indent}  duration_ms: {duration_ms}\n"));

    if let Some(failure) = failure {
        out.push_str(&format!(
            "{indent}  error: {}\n",
            single_line(&failure.error_message())
        ));
        out.push_str(&format!("{indent}  failureType: {}\n", failure.kind));

        if let Some(stack) = failure.stack() {
            let frames = clean_stack(stack);
            if !frames.is_empty() {
                let delimiter = format!("\n{indent}    ");
                out.push_str(&format!("{indent}  stack: |-{delimiter}"));
                out.push_str(&frames.join(&delimiter));
                out.push('\n');
            }
        }
    }

    out.push_str(&format!("{indent}  ...\n"));
    out
}

/// Strip frame markup from a stack trace and drop the first line, which
/// repeats the error message.
pub fn clean_stack(stack: &str) -> Vec<String> {
    stack
        .lines()
        .skip(1)
        .map(|line| {
            let line = line.trim();
            line.strip_prefix("at ").unwrap_or(line).to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

pub fn diagnostic(indent: &str, message: &str) -> String {
    if message.is_empty() {
        return format!("{indent}#\n");
    }
    message
        .lines()
        .map(|line| format!("{indent}# {line}\n"))
        .collect()
}

pub fn bail(message: Option<&str>) -> String {
    match message {
        Some(msg) if !msg.is_empty() => format!("Bail out! {msg}\n"),
        _ => "Bail out!\n".to_string(),
    }
}

/// Re-indent a foreign result stream one level under `indent`, dropping
/// blank lines and its version preamble.
pub fn nested_output(indent: &str, output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.is_empty() && !is_version_line(line))
        .map(|line| format!("{indent}{INDENT}{line}\n"))
        .collect()
}

fn is_version_line(line: &str) -> bool {
    line.strip_prefix("TAP version ")
        .map(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn single_line(message: &str) -> String {
    message.lines().collect::<Vec<_>>().join(" ")
}
