//! Sequential runner for setup tasks.

use crate::executor::{
    ExecutionContext, OutputCallback, PtyExecutor, SubprocessExecutor, TaskExecutor,
};
use crate::types::{TaskConfig, TaskError, TaskOutcome};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Runs setup tasks one after another, stopping at the first failure.
///
/// Tasks marked `in_shell` go through the PTY executor when one is present
/// and fall back to a subprocess otherwise. The runner is consumed by
/// [`TaskRunner::run`] so the PTY executor's channel closes once the last
/// task is done, which lets the shell session move on.
pub struct TaskRunner {
    tasks: Vec<TaskConfig>,
    subprocess: SubprocessExecutor,
    pty: Option<PtyExecutor>,
    cancellation: CancellationToken,
}

impl TaskRunner {
    pub fn new(tasks: Vec<TaskConfig>, cancellation: CancellationToken) -> Self {
        Self {
            tasks,
            subprocess: SubprocessExecutor::new(),
            pty: None,
            cancellation,
        }
    }

    pub fn with_pty(mut self, executor: PtyExecutor) -> Self {
        self.pty = Some(executor);
        self
    }

    fn executor_for(&self, task: &TaskConfig) -> &dyn TaskExecutor {
        match (&self.pty, task.in_shell) {
            (Some(pty), true) => pty as &dyn TaskExecutor,
            (None, true) => {
                tracing::debug!("task {}: no shell available, running as subprocess", task.name);
                &self.subprocess
            }
            _ => &self.subprocess,
        }
    }

    /// Run every task in order. The returned outcomes end with the first
    /// failed task, if any.
    pub async fn run(self, callback: &dyn OutputCallback) -> Result<Vec<TaskOutcome>, TaskError> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());

        for task in &self.tasks {
            if self.cancellation.is_cancelled() {
                tracing::debug!("tasks: cancelled before {}", task.name);
                break;
            }

            let output_file = tempfile::Builder::new()
                .prefix("reshell-task-")
                .suffix(".json")
                .tempfile()?;

            tracing::info!("tasks: running {}", task.name);
            let ctx = ExecutionContext {
                command: &task.command,
                cwd: task.cwd.as_deref(),
                env: task.env.clone(),
                output_file_path: output_file.path(),
            };
            let result = self
                .executor_for(task)
                .execute(ctx, callback, self.cancellation.clone())
                .await;

            let outputs = read_outputs(output_file.path());
            let success = result.success;
            if !success {
                tracing::warn!(
                    "tasks: {} failed: {}",
                    task.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            outcomes.push(TaskOutcome {
                name: task.name.clone(),
                result,
                outputs,
            });
            if !success {
                break;
            }
        }

        Ok(outcomes)
    }
}

/// Parse a task's output file. Empty or missing files mean no outputs.
fn read_outputs(path: &Path) -> serde_json::Value {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return serde_json::Value::Null,
    };
    if contents.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(&contents).unwrap_or_else(|e| {
        tracing::warn!("tasks: ignoring malformed outputs in {}: {}", path.display(), e);
        serde_json::Value::Null
    })
}

/// Turn the last outcome into an error if it failed.
pub fn check_outcomes(outcomes: &[TaskOutcome]) -> Result<(), TaskError> {
    match outcomes.last() {
        Some(outcome) if !outcome.result.success => Err(TaskError::Failed {
            name: outcome.name.clone(),
            message: outcome
                .result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }),
        _ => Ok(()),
    }
}
