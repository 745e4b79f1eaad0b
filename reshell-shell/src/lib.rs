//! Shell and PTY management for reshell.
//!
//! This crate owns everything that touches the interactive shell: spawning
//! it on a PTY, the bash init script with its reload hook, running setup
//! tasks inside it through the marker protocol, and the interactive session
//! with its status line.

pub mod bash;
pub mod marker;
mod output_filter;
mod protocol;
mod pty;
mod session;
mod status_line;
mod task_runner;
mod terminal;

// Protocol types
pub use protocol::{
    PendingTask, SessionCommand, SessionEvent, TaskId, TaskRequest, TaskResult,
};

// PTY management
pub use pty::{Pty, PtyError, PtyOutput, get_terminal_size};

// Terminal utilities
pub use terminal::RawModeGuard;

// Status line
pub use status_line::{
    CHECKMARK, COLOR_ACTIVE, COLOR_COMPLETED, COLOR_FAILED, COLOR_INTERACTIVE, COLOR_SECONDARY,
    SPINNER_FRAMES, SPINNER_INTERVAL_MS, StatusKind, StatusLine, StatusState, XMARK,
    render_status, render_status_plain,
};

// Task execution
pub use task_runner::{DEFAULT_TASK_TIMEOUT, PtyTaskRunner, Replay, TaskRunnerError};

// Main session
pub use session::{
    SessionConfig, SessionError, SessionIo, SessionState, ShellSession, TerminalHandoff,
};

// Re-export for convenience
pub use portable_pty::{CommandBuilder, PtySize};
