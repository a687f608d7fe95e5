//! Pass/fail reporting.
//!
//! The status channel carries one line per verdict and nothing else. Logs go
//! through `tracing` (stderr) and tool output to the diagnostics sink, so a
//! script's report can be grepped without filtering.

use std::io::{self, Write};

use crate::error::HarnessError;

/// Observed vs. expected exit code of one guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitExpectation {
    pub observed: i32,
    pub expected: i32,
    pub label: String,
}

impl ExitExpectation {
    pub fn new(observed: i32, expected: i32, label: impl Into<String>) -> Self {
        Self {
            observed,
            expected,
            label: label.into(),
        }
    }

    pub fn is_met(&self) -> bool {
        self.observed == self.expected
    }

    /// `<label> FAIL(<observed> != <expected>)`
    pub fn describe(&self) -> String {
        format!("{} FAIL({} != {})", self.label, self.observed, self.expected)
    }
}

pub struct StatusChannel {
    out: Box<dyn Write + Send>,
    tag: Option<String>,
}

impl StatusChannel {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            tag: None,
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Leading label of every line, usually the test name. Without one, each
    /// line leads with the description of the operation it reports on.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// `<label>: <description> FAIL(<observed> != <expected>).`
    pub fn mismatch(&mut self, expectation: &ExitExpectation) -> Result<(), HarnessError> {
        let line = format!(
            "{}: {}.",
            self.leading(&expectation.label),
            expectation.describe()
        );
        self.write_line(&line)
    }

    /// `<label>: <reason> FAIL.`
    pub fn failed(&mut self, reason: &str) -> Result<(), HarnessError> {
        let line = format!("{}: {} FAIL.", self.leading(reason), reason);
        self.write_line(&line)
    }

    /// `<label>: success.`
    pub fn success(&mut self, label: &str) -> Result<(), HarnessError> {
        let line = format!("{}: success.", self.leading(label));
        self.write_line(&line)
    }

    fn leading<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.tag.as_deref().unwrap_or(fallback)
    }

    fn write_line(&mut self, line: &str) -> Result<(), HarnessError> {
        writeln!(self.out, "{line}")
            .and_then(|()| self.out.flush())
            .map_err(HarnessError::StatusWrite)
    }
}
