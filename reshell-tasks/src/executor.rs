use crate::types::{ExecutionResult, TASK_OUTPUT_FILE_ENV};
use async_trait::async_trait;
use reshell_shell::{PendingTask, TaskId, TaskRequest};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and SIGKILL for a cancelled subprocess.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Context for executing a task command.
pub struct ExecutionContext<'a> {
    /// Shell command line to run.
    pub command: &'a str,
    /// Working directory for the command.
    pub cwd: Option<&'a Path>,
    /// Environment variables to set.
    pub env: BTreeMap<String, String>,
    /// Path exported as `RESHELL_TASK_OUTPUT_FILE` to subprocess tasks.
    /// In-shell tasks never see it, so nothing dangling is left in the
    /// user's shell.
    pub output_file_path: &'a Path,
}

/// Callback for streaming output lines during execution.
pub trait OutputCallback: Send + Sync {
    fn on_stdout(&self, line: &str);
    fn on_stderr(&self, line: &str);
}

/// A no-op output callback for when streaming is not needed.
pub struct NoOpCallback;

impl OutputCallback for NoOpCallback {
    fn on_stdout(&self, _line: &str) {}
    fn on_stderr(&self, _line: &str) {}
}

/// Runs task commands.
///
/// Tasks run either as detached subprocesses or inside the interactive
/// shell, where exports and directory changes persist for the user.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: ExecutionContext<'_>,
        callback: &dyn OutputCallback,
        cancellation: CancellationToken,
    ) -> ExecutionResult;
}

/// Executor that spawns each command with `<shell> -c`.
pub struct SubprocessExecutor {
    shell: PathBuf,
}

impl SubprocessExecutor {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    let _ = nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal);
}

#[async_trait]
impl TaskExecutor for SubprocessExecutor {
    async fn execute(
        &self,
        ctx: ExecutionContext<'_>,
        callback: &dyn OutputCallback,
        cancellation: CancellationToken,
    ) -> ExecutionResult {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::process::Command;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(ctx.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        if let Some(cwd) = ctx.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &ctx.env {
            command.env(key, value);
        }
        command.env(TASK_OUTPUT_FILE_ENV, ctx.output_file_path);

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ExecutionResult::failed(format!(
                    "Failed to spawn {} for {:?}: {e}",
                    self.shell.display(),
                    ctx.command
                ));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ExecutionResult::failed("Failed to capture task output");
        };
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut stdout_closed = false;
        let mut stderr_closed = false;
        let mut exit_status: Option<std::process::ExitStatus> = None;

        while exit_status.is_none() || !stdout_closed || !stderr_closed {
            tokio::select! {
                result = stdout_reader.next_line(), if !stdout_closed => match result {
                    Ok(Some(line)) => {
                        callback.on_stdout(&line);
                        stdout_lines.push(line);
                    }
                    Ok(None) => stdout_closed = true,
                    Err(e) => {
                        tracing::error!("Error reading stdout: {}", e);
                        stdout_closed = true;
                    }
                },
                result = stderr_reader.next_line(), if !stderr_closed => match result {
                    Ok(Some(line)) => {
                        callback.on_stderr(&line);
                        stderr_lines.push(line);
                    }
                    Ok(None) => stderr_closed = true,
                    Err(e) => {
                        tracing::error!("Error reading stderr: {}", e);
                        stderr_closed = true;
                    }
                },
                result = child.wait(), if exit_status.is_none() => match result {
                    Ok(status) => exit_status = Some(status),
                    Err(e) => {
                        return ExecutionResult {
                            stdout_lines,
                            stderr_lines,
                            ..ExecutionResult::failed(format!("Error waiting for command: {e}"))
                        };
                    }
                },
                _ = cancellation.cancelled() => {
                    if let Some(pid) = child.id() {
                        #[cfg(unix)]
                        signal_group(pid, nix::sys::signal::Signal::SIGTERM);
                        tokio::select! {
                            _ = child.wait() => {}
                            _ = tokio::time::sleep(KILL_GRACE) => {
                                #[cfg(unix)]
                                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                                let _ = child.wait().await;
                            }
                        }
                    }
                    return ExecutionResult {
                        stdout_lines,
                        stderr_lines,
                        ..ExecutionResult::failed("Task cancelled")
                    };
                }
            }
        }

        let exit_code = exit_status.and_then(|s| s.code());
        let success = exit_status.is_some_and(|s| s.success());
        ExecutionResult {
            success,
            exit_code,
            stdout_lines,
            stderr_lines,
            error: (!success).then(|| match exit_status {
                Some(status) => format!("Task exited with status: {status}"),
                None => "Task exited with unknown status".to_string(),
            }),
        }
    }
}

/// Executor that runs commands inside the interactive shell.
///
/// Requests go to the shell session, which injects them into its PTY and
/// answers once the end marker is seen. Output arrives as one stream; the
/// shell does not separate stderr.
pub struct PtyExecutor {
    task_tx: mpsc::Sender<PendingTask>,
}

impl PtyExecutor {
    pub fn new(task_tx: mpsc::Sender<PendingTask>) -> Self {
        Self { task_tx }
    }
}

#[async_trait]
impl TaskExecutor for PtyExecutor {
    async fn execute(
        &self,
        ctx: ExecutionContext<'_>,
        callback: &dyn OutputCallback,
        cancellation: CancellationToken,
    ) -> ExecutionResult {
        let request = TaskRequest {
            id: TaskId::generate(),
            command: ctx.command.to_string(),
            env: ctx.env,
            cwd: ctx.cwd.map(Path::to_path_buf),
        };
        tracing::debug!("pty executor: sending task {}", request.id);

        let (respond_to, response_rx) = oneshot::channel();
        let pending = PendingTask {
            request,
            respond_to,
        };
        if self.task_tx.send(pending).await.is_err() {
            return ExecutionResult::failed("Shell is no longer accepting tasks");
        }

        tokio::select! {
            result = response_rx => match result {
                Ok(result) => {
                    tracing::trace!(
                        "pty executor: task {} exited with {:?}, error={:?}",
                        result.id,
                        result.exit_code,
                        result.error
                    );
                    let stdout_lines: Vec<String> =
                        result.captured_output.lines().map(str::to_string).collect();
                    for line in &stdout_lines {
                        callback.on_stdout(line);
                    }
                    let success = result.success();
                    let error = result.error.clone().or_else(|| {
                        (!success).then(|| match result.exit_code {
                            Some(code) => format!("Task exited with code {code}"),
                            None => "Task exited with unknown status".to_string(),
                        })
                    });
                    ExecutionResult {
                        success,
                        exit_code: result.exit_code,
                        stdout_lines,
                        stderr_lines: Vec::new(),
                        error,
                    }
                }
                Err(_) => ExecutionResult::failed("Shell dropped the task"),
            },
            _ = cancellation.cancelled() => ExecutionResult::failed("Task cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reshell_shell::TaskResult;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        stdout: Mutex<Vec<String>>,
        stderr: Mutex<Vec<String>>,
    }

    impl OutputCallback for Recorder {
        fn on_stdout(&self, line: &str) {
            self.stdout.lock().unwrap().push(line.to_string());
        }
        fn on_stderr(&self, line: &str) {
            self.stderr.lock().unwrap().push(line.to_string());
        }
    }

    fn ctx<'a>(command: &'a str, output: &'a Path) -> ExecutionContext<'a> {
        ExecutionContext {
            command,
            cwd: None,
            env: BTreeMap::new(),
            output_file_path: output,
        }
    }

    #[tokio::test]
    async fn test_subprocess_captures_streams() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let recorder = Recorder::default();

        let result = SubprocessExecutor::new()
            .execute(
                ctx("echo out; echo err >&2", &output),
                &recorder,
                CancellationToken::new(),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout_lines, ["out"]);
        assert_eq!(result.stderr_lines, ["err"]);
        assert_eq!(*recorder.stdout.lock().unwrap(), ["out"]);
        assert_eq!(*recorder.stderr.lock().unwrap(), ["err"]);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_subprocess_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let result = SubprocessExecutor::new()
            .execute(ctx("exit 3", &output), &NoOpCallback, CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.unwrap().contains("status"));
    }

    #[tokio::test]
    async fn test_subprocess_env_cwd_and_output_file() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let mut context = ctx(
            "printf '%s %s\\n' \"$GREETING\" \"$(pwd)\"; echo '{\"k\": 1}' > \"$RESHELL_TASK_OUTPUT_FILE\"",
            &output,
        );
        context.cwd = Some(dir.path());
        context.env.insert("GREETING".into(), "hello".into());

        let result = SubprocessExecutor::new()
            .execute(context, &NoOpCallback, CancellationToken::new())
            .await;

        assert!(result.success, "{:?}", result.error);
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            result.stdout_lines,
            [format!("hello {}", canonical.display())]
        );
        assert_eq!(std::fs::read_to_string(&output).unwrap().trim(), "{\"k\": 1}");
    }

    #[tokio::test]
    async fn test_subprocess_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let result = SubprocessExecutor::with_shell("/nonexistent/shell")
            .execute(ctx("true", &output), &NoOpCallback, CancellationToken::new())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_subprocess_cancellation_kills_group() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let start = std::time::Instant::now();
        let result = SubprocessExecutor::new()
            .execute(ctx("sleep 30 & wait", &output), &NoOpCallback, token)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Task cancelled"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pty_executor_round_trip() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let (task_tx, mut task_rx) = mpsc::channel::<PendingTask>(1);

        // Stand-in for the shell session.
        let session = tokio::spawn(async move {
            let PendingTask {
                request,
                respond_to,
            } = task_rx.recv().await.unwrap();
            assert!(request.id.is_valid());
            assert_eq!(request.command, "make");
            assert_eq!(request.cwd.as_deref(), Some(Path::new("/work")));
            assert!(!request.env.contains_key(TASK_OUTPUT_FILE_ENV));
            assert_eq!(request.env.get("A").map(String::as_str), Some("1"));
            respond_to
                .send(TaskResult {
                    id: request.id,
                    exit_code: Some(2),
                    captured_output: "line one\nline two".into(),
                    error: None,
                })
                .unwrap();
        });

        let recorder = Recorder::default();
        let mut context = ctx("make", &output);
        context.cwd = Some(Path::new("/work"));
        context.env.insert("A".into(), "1".into());
        let result = PtyExecutor::new(task_tx)
            .execute(context, &recorder, CancellationToken::new())
            .await;
        session.await.unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stdout_lines, ["line one", "line two"]);
        assert_eq!(*recorder.stdout.lock().unwrap(), ["line one", "line two"]);
        assert_eq!(result.error.as_deref(), Some("Task exited with code 2"));
    }

    #[tokio::test]
    async fn test_pty_executor_without_session() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let (task_tx, task_rx) = mpsc::channel::<PendingTask>(1);
        drop(task_rx);

        let result = PtyExecutor::new(task_tx)
            .execute(ctx("true", &output), &NoOpCallback, CancellationToken::new())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no longer accepting"));
    }

    #[tokio::test]
    async fn test_pty_executor_dropped_response() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.json");
        let (task_tx, mut task_rx) = mpsc::channel::<PendingTask>(1);
        tokio::spawn(async move {
            // Receive and drop without answering.
            let _ = task_rx.recv().await;
        });

        let result = PtyExecutor::new(task_tx)
            .execute(ctx("true", &output), &NoOpCallback, CancellationToken::new())
            .await;
        assert_eq!(result.error.as_deref(), Some("Shell dropped the task"));
    }
}
