//! Fakes for driving the harness without bridge or link tools.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::runner::CommandRunner;

/// Commands seen by a [`ScriptedRunner`], shared with the test after the
/// runner has been moved into a harness.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Vec<String>>>>);

impl CallLog {
    /// Every command so far, argv joined with spaces.
    pub fn commands(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers with scripted exit codes.
///
/// A command matching a `fail_on` rule (substring of the joined argv) gets
/// that rule's code; otherwise the next queued code is used, then `0`.
/// Background starts are scripted the same way; stopping one is logged as
/// `kill <id>`.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, i32)>,
    queued: VecDeque<i32>,
    calls: CallLog,
    next_id: u32,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            queued: codes.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn fail_on(mut self, fragment: &str, code: i32) -> Self {
        self.rules.push((fragment.to_string(), code));
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&mut self, argv: &[String]) -> i32 {
        let joined = argv.join(" ");
        self.calls.0.lock().unwrap().push(argv.to_vec());
        self.rules
            .iter()
            .find(|(fragment, _)| joined.contains(fragment.as_str()))
            .map(|(_, code)| *code)
            .or_else(|| self.queued.pop_front())
            .unwrap_or(0)
    }

    fn spawn(&mut self, argv: &[String]) -> Result<u32, i32> {
        match self.run(argv) {
            0 => {
                self.next_id += 1;
                Ok(self.next_id)
            }
            code => Err(code),
        }
    }

    fn stop(&mut self, id: u32) -> i32 {
        self.calls
            .0
            .lock()
            .unwrap()
            .push(vec!["kill".to_string(), id.to_string()]);
        0
    }
}

/// In-memory status channel target.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
