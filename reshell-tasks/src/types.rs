use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable naming the file a task may write JSON outputs to.
pub const TASK_OUTPUT_FILE_ENV: &str = "RESHELL_TASK_OUTPUT_FILE";

/// A setup task as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Run inside the interactive shell so its exports persist there.
    #[serde(default)]
    pub in_shell: bool,
}

/// Result of a task execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A finished task with whatever it wrote to its output file.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub result: ExecutionResult,
    pub outputs: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task {name} failed: {message}")]
    Failed { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_config_defaults() {
        let task: TaskConfig =
            serde_json::from_str(r#"{"name": "setup", "command": "make deps"}"#).unwrap();
        assert_eq!(
            task,
            TaskConfig {
                name: "setup".into(),
                command: "make deps".into(),
                cwd: None,
                env: BTreeMap::new(),
                in_shell: false,
            }
        );
    }

    #[test]
    fn test_failed_result() {
        let result = ExecutionResult::failed("boom");
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }
}
