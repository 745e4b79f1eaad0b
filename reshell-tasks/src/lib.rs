//! Setup tasks for reshell.
//!
//! Tasks run before the user takes over the shell, either as detached
//! subprocesses or inside the interactive shell itself.

mod executor;
mod runner;
mod types;

pub use executor::{
    ExecutionContext, NoOpCallback, OutputCallback, PtyExecutor, SubprocessExecutor, TaskExecutor,
};
pub use runner::{TaskRunner, check_outcomes};
pub use types::{ExecutionResult, TASK_OUTPUT_FILE_ENV, TaskConfig, TaskError, TaskOutcome};
