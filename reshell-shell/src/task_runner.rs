//! Runs setup tasks inside the live shell before the user gets the terminal.
//!
//! The runner borrows the session's PTY and its output channel. It waits for
//! the readiness marker printed by the init script, executes each task with
//! the marker protocol, and finally restores the prompt and drains residual
//! output so the user starts from a single clean prompt.

use crate::marker::{self, DRAIN_SENTINEL, MarkerScanner, READY_MARKER, ScanStep};
use crate::protocol::{PendingTask, TaskId, TaskRequest, TaskResult};
use crate::pty::{Pty, PtyOutput};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TaskRunnerError {
    #[error("failed to write to PTY: {0}")]
    Io(#[from] std::io::Error),
    #[error("shell closed before it was ready")]
    ShellNotReady,
    #[error("shell did not become ready within {0:?}")]
    ReadyTimeout(Duration),
}

/// Output of the pre-interactive phase that should still reach the user.
#[derive(Debug, Default)]
pub struct Replay {
    /// Output printed before the readiness marker (user rc files).
    pub preamble: Vec<u8>,
    /// Output following the drain, normally the first prompt.
    pub tail: Vec<u8>,
}

impl Replay {
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.preamble.append(&mut self.tail);
        self.preamble
    }
}

enum ReadError {
    Closed,
    TimedOut,
}

pub struct PtyTaskRunner<'a> {
    pty: &'a mut Pty,
    output: &'a mut mpsc::Receiver<PtyOutput>,
    timeout: Duration,
    used_ids: HashSet<TaskId>,
    /// Bytes read past the last complete line.
    pending: Vec<u8>,
    closed: bool,
    preamble: Vec<u8>,
}

impl<'a> PtyTaskRunner<'a> {
    pub fn new(
        pty: &'a mut Pty,
        output: &'a mut mpsc::Receiver<PtyOutput>,
        timeout: Duration,
    ) -> Self {
        Self {
            pty,
            output,
            timeout,
            used_ids: HashSet::new(),
            pending: Vec::new(),
            closed: false,
            preamble: Vec::new(),
        }
    }

    async fn read_chunk(&mut self, deadline: Instant) -> Result<(), ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        match tokio::time::timeout_at(deadline, self.output.recv()).await {
            Ok(Some(PtyOutput::Data(data))) => {
                tracing::trace!(
                    "task_runner: read {} bytes: {:?}",
                    data.len(),
                    String::from_utf8_lossy(&data)
                );
                self.pending.extend_from_slice(&data);
                Ok(())
            }
            Ok(Some(PtyOutput::Closed)) | Ok(None) => {
                self.closed = true;
                Err(ReadError::Closed)
            }
            Err(_) => Err(ReadError::TimedOut),
        }
    }

    /// Next complete line from the pending buffer, without its newline.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    /// Wait for the init script's readiness marker.
    ///
    /// Everything printed before the marker line is kept for replay.
    pub async fn wait_for_shell_ready(&mut self) -> Result<(), TaskRunnerError> {
        tracing::trace!("task_runner: waiting for shell to be ready");
        let deadline = Instant::now() + self.timeout;

        loop {
            while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line = String::from_utf8_lossy(&self.pending[..pos]).into_owned();
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                if marker::clean_line(&line).trim() == READY_MARKER {
                    tracing::trace!("task_runner: shell is ready");
                    return Ok(());
                }
                self.preamble.extend_from_slice(&raw);
            }

            match self.read_chunk(deadline).await {
                Ok(()) => {}
                Err(ReadError::Closed) => return Err(TaskRunnerError::ShellNotReady),
                Err(ReadError::TimedOut) => {
                    return Err(TaskRunnerError::ReadyTimeout(self.timeout));
                }
            }
        }
    }

    /// Run a single request through the marker protocol.
    pub async fn execute(&mut self, request: TaskRequest) -> TaskResult {
        let id = request.id.clone();

        if !id.is_valid() {
            return TaskResult::failed(id, "task id must match [A-Za-z0-9_-]+");
        }
        if !self.used_ids.insert(id.clone()) {
            return TaskResult::failed(id.clone(), format!("task id {id} was already used"));
        }
        if self.closed {
            return TaskResult::failed(id, "shell closed");
        }

        let line = marker::inject_command(&request);
        tracing::trace!("task_runner: injecting {:?}", line);
        if let Err(e) = self.pty.write_all(line.as_bytes()) {
            return TaskResult::failed(id, format!("failed to write to PTY: {e}"));
        }

        let mut scanner = MarkerScanner::new(id.clone());
        let deadline = Instant::now() + self.timeout;

        loop {
            while let Some(line) = self.take_line() {
                if let ScanStep::Finished { exit_code } = scanner.feed_line(&line) {
                    tracing::debug!("task_runner: task {} exited with {}", id, exit_code);
                    return TaskResult {
                        id,
                        exit_code: Some(exit_code),
                        captured_output: scanner.captured_output(),
                        error: scanner.violation().map(str::to_owned),
                    };
                }
            }

            let error = match self.read_chunk(deadline).await {
                Ok(()) => continue,
                Err(ReadError::Closed) => "shell closed during task".to_string(),
                Err(ReadError::TimedOut) => {
                    // Interrupt the task so the shell is usable again. Its
                    // end marker may still show up and is ignored later.
                    let _ = self.pty.write_all(&[0x03]);
                    format!("task timed out after {:?}", self.timeout)
                }
            };
            tracing::warn!("task_runner: task {}: {}", id, error);
            return TaskResult {
                id,
                exit_code: None,
                captured_output: scanner.captured_output(),
                error: Some(error),
            };
        }
    }

    /// Process requests until the channel closes, then restore the prompt
    /// and drain the output.
    pub async fn run(
        &mut self,
        task_rx: &mut mpsc::Receiver<PendingTask>,
    ) -> Result<Replay, TaskRunnerError> {
        self.wait_for_shell_ready().await?;
        self.disable_prompt_command()?;

        while let Some(PendingTask {
            request,
            respond_to,
        }) = task_rx.recv().await
        {
            let result = self.execute(request).await;
            let _ = respond_to.send(result);
        }

        if self.closed {
            return Ok(Replay {
                preamble: std::mem::take(&mut self.preamble),
                tail: std::mem::take(&mut self.pending),
            });
        }
        self.restore_prompt_command()?;
        self.drain().await;

        Ok(Replay {
            preamble: std::mem::take(&mut self.preamble),
            tail: std::mem::take(&mut self.pending),
        })
    }

    /// Prompt hooks would run between every task; park them.
    fn disable_prompt_command(&mut self) -> Result<(), TaskRunnerError> {
        self.pty
            .write_all(b" __reshell_saved_pc=\"$PROMPT_COMMAND\"; PROMPT_COMMAND=\n")?;
        Ok(())
    }

    fn restore_prompt_command(&mut self) -> Result<(), TaskRunnerError> {
        self.pty.write_all(
            b" PROMPT_COMMAND=\"$__reshell_saved_pc\"; unset __reshell_saved_pc\n",
        )?;
        Ok(())
    }

    /// Consume output up to two sentinel lines.
    ///
    /// The prompt printed between the two sentinels is swallowed, so what
    /// remains afterwards is exactly one fresh prompt. History is switched
    /// back on by the last internal command.
    async fn drain(&mut self) {
        let cmd = format!(" echo '{DRAIN_SENTINEL}'\n echo '{DRAIN_SENTINEL}'; set -o history\n");
        if let Err(e) = self.pty.write_all(cmd.as_bytes()) {
            tracing::warn!("task_runner: failed to send drain sentinel: {}", e);
            return;
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut seen = 0;
        loop {
            while let Some(line) = self.take_line() {
                if marker::clean_line(&line).trim() == DRAIN_SENTINEL {
                    seen += 1;
                    if seen == 2 {
                        return;
                    }
                }
            }
            if self.read_chunk(deadline).await.is_err() {
                tracing::warn!("task_runner: drain ended before both sentinels arrived");
                return;
            }
        }
    }
}
