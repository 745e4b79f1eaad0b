//! Marker protocol for running a task inside the live shell.
//!
//! A task is injected as a single command line:
//!
//! ```text
//!  echo '__RESHELL_TASK_START_<id>_'; export K='v'; cd '<cwd>'; ( <command> ); echo $'\n''__RESHELL_TASK_END_<id>_'$?'_'
//! ```
//!
//! and its output is recovered by scanning the PTY output for the two marker
//! lines. Only lines that are exactly a marker, once control sequences are
//! stripped, count as frames; the echo of the command line itself never
//! matches. The end marker is preceded by a newline so it starts a line of
//! its own even when the task's output does not end with one; the scanner
//! drops the empty line this leaves behind.

use crate::protocol::{TaskId, TaskRequest};
use strip_ansi_escapes::strip_str;

pub const START_MARKER: &str = "__RESHELL_TASK_START";
pub const END_MARKER: &str = "__RESHELL_TASK_END";
pub const READY_MARKER: &str = "__RESHELL_SHELL_READY__";
pub const DRAIN_SENTINEL: &str = "__RESHELL_DRAIN_DONE__";

/// Quote a value for a POSIX shell using single quotes.
fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn is_env_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The line written to the PTY for `request`, newline included.
///
/// The leading space keeps the line out of shell history. The command runs
/// in a subshell so `exit` ends only the task, while the exports and the
/// directory change apply to the live shell. `$?` is expanded as an argument
/// of the end marker's `echo`, so it still holds the subshell's status.
pub fn inject_command(request: &TaskRequest) -> String {
    let id = request.id.as_str();
    let mut parts = vec![format!("echo '{START_MARKER}_{id}_'")];

    for (key, value) in &request.env {
        if !is_env_name(key) {
            tracing::warn!("marker: skipping invalid variable name {:?}", key);
            continue;
        }
        parts.push(format!("export {key}={}", single_quote(value)));
    }

    if let Some(cwd) = &request.cwd {
        parts.push(format!("cd {}", single_quote(&cwd.to_string_lossy())));
    }

    parts.push(format!("( {} )", request.command));
    parts.push(format!("echo $'\\n''{END_MARKER}_{id}_'$?'_'"));

    format!(" {}\n", parts.join("; "))
}

/// A protocol frame found in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Start(TaskId),
    End(TaskId, i32),
}

/// Clean one raw output line: control sequences stripped, carriage returns
/// removed.
pub fn clean_line(raw: &str) -> String {
    strip_str(raw).replace('\r', "")
}

/// Recognise a cleaned line as a marker frame.
pub fn parse_marker(line: &str) -> Option<Marker> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(START_MARKER) {
        let id = TaskId::from(rest.strip_prefix('_')?.strip_suffix('_')?);
        return id.is_valid().then_some(Marker::Start(id));
    }

    if let Some(rest) = line.strip_prefix(END_MARKER) {
        let body = rest.strip_prefix('_')?.strip_suffix('_')?;
        let (id, code) = body.rsplit_once('_')?;
        let id = TaskId::from(id);
        let code = code.parse::<i32>().ok()?;
        return id.is_valid().then_some(Marker::End(id, code));
    }

    None
}

/// Progress of one task through the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    /// Keep reading.
    Continue,
    /// The end marker arrived.
    Finished { exit_code: i32 },
}

/// Line-by-line scanner for the frames of a single task.
#[derive(Debug)]
pub struct MarkerScanner {
    id: TaskId,
    started: bool,
    captured: Vec<String>,
    violation: Option<String>,
}

impl MarkerScanner {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            started: false,
            captured: Vec::new(),
            violation: None,
        }
    }

    /// Feed one output line without its trailing newline.
    pub fn feed_line(&mut self, raw: &str) -> ScanStep {
        let line = clean_line(raw);

        match parse_marker(&line) {
            Some(Marker::Start(id)) if id == self.id => {
                if self.started {
                    self.record_violation(format!("duplicate start marker for task {id}"));
                } else {
                    self.started = true;
                }
            }
            Some(Marker::End(id, code)) if id == self.id => {
                if self.started {
                    // Left by the newline written ahead of the end marker.
                    if self.captured.last().is_some_and(|line| line.is_empty()) {
                        self.captured.pop();
                    }
                    return ScanStep::Finished { exit_code: code };
                }
                self.record_violation(format!("end marker for task {id} before its start"));
            }
            Some(Marker::Start(other)) | Some(Marker::End(other, _)) => {
                if self.started {
                    self.record_violation(format!(
                        "unexpected marker for task {other} while capturing {}",
                        self.id
                    ));
                } else {
                    // Left over from an earlier task that timed out.
                    tracing::warn!("marker: ignoring stray marker for task {}", other);
                }
            }
            None => {
                if self.started {
                    self.captured.push(line);
                }
            }
        }

        ScanStep::Continue
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn captured_output(&self) -> String {
        self.captured.join("\n")
    }

    /// First protocol violation seen, if any.
    pub fn violation(&self) -> Option<&str> {
        self.violation.as_deref()
    }

    fn record_violation(&mut self, message: String) {
        tracing::warn!("marker: {}", message);
        self.violation.get_or_insert(message);
    }
}
