//! Messages exchanged between the coordinator, the shell session and task
//! executors.
//!
//! The coordinator talks to the session through an ordered [`SessionCommand`]
//! channel and listens for [`SessionEvent`]s coming back. Tasks that must run
//! inside the live shell arrive as [`PendingTask`]s.

use portable_pty::CommandBuilder;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Commands sent from the coordinator to the shell session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Spawn the interactive shell with this command.
    Spawn {
        command: CommandBuilder,
        watch_paths: Vec<PathBuf>,
    },
    /// The watch set was recomputed.
    WatchedPaths { paths: Vec<PathBuf> },
    /// A change was detected and a rebuild started.
    Building { changed_paths: Vec<PathBuf> },
    /// A new environment was published to the reload file. The shell picks
    /// it up on its next prompt or when the reload key is pressed.
    ReloadReady { changed_paths: Vec<PathBuf> },
    /// The rebuild failed; the shell keeps its current environment.
    BuildFailed {
        changed_paths: Vec<PathBuf>,
        message: String,
    },
    /// The shell consumed the reload file.
    ReloadApplied,
    /// File watching was paused or resumed.
    WatchingPaused { paused: bool },
    /// The coordinator is shutting down.
    Shutdown,
}

/// Events sent from the shell session to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The shell process exited.
    Exited { exit_code: Option<u32> },
    /// The real terminal was resized.
    Resized { cols: u16, rows: u16 },
    /// User pressed Ctrl-Alt-D.
    TogglePause,
}

/// Identifier of one in-shell task invocation.
///
/// Ids travel inside marker lines, so they are restricted to
/// `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// A fresh id made of a process-wide counter and a random suffix, so a
    /// task printing a marker-shaped line is unlikely to guess it.
    pub fn generate() -> Self {
        let n = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{n}-{}", &random[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A command to run inside the live shell.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub id: TaskId,
    /// Shell command line, executed in a subshell.
    pub command: String,
    /// Variables exported into the live shell before the command runs.
    pub env: BTreeMap<String, String>,
    /// Directory the live shell changes into before the command runs.
    pub cwd: Option<PathBuf>,
}

impl TaskRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            command: command.into(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

/// A [`TaskRequest`] together with the channel its result goes back on.
pub struct PendingTask {
    pub request: TaskRequest,
    pub respond_to: oneshot::Sender<TaskResult>,
}

/// Outcome of a task executed through the marker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub id: TaskId,
    /// Exit status parsed from the end marker, if it was seen.
    pub exit_code: Option<i32>,
    /// Lines printed between the start and end markers, control sequences
    /// stripped, joined with `\n`.
    pub captured_output: String,
    /// Set when the protocol itself failed (timeout, closed PTY, stray
    /// markers), independently of the exit code.
    pub error: Option<String>,
}

impl TaskResult {
    pub fn failed(id: TaskId, error: impl Into<String>) -> Self {
        Self {
            id,
            exit_code: None,
            captured_output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}
