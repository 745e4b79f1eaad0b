//! Shell session management.
//!
//! [`ShellSession`] owns the PTY and the real terminal. It spawns the shell
//! as soon as the coordinator sends `Spawn`, optionally runs setup tasks in
//! it while a front-end still owns the terminal, then copies bytes between
//! the terminal and the PTY with a status line on the last row.
//!
//! The session never touches the shell's environment. A `ReloadReady`
//! command only changes what the status line says; the shell picks the new
//! environment up itself.

use crate::output_filter::{OutputFilter, TerminalEvent};
use crate::protocol::{PendingTask, SessionCommand, SessionEvent};
use crate::pty::{Pty, PtyError, PtyOutput, get_terminal_size};
use crate::status_line::{SPINNER_INTERVAL_MS, StatusLine};
use crate::task_runner::{DEFAULT_TASK_TIMEOUT, PtyTaskRunner, TaskRunnerError};
use crate::terminal::RawModeGuard;
use crossterm::terminal;
use portable_pty::{CommandBuilder, PtySize};
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

/// Ctrl-Alt-D.
const TOGGLE_PAUSE_KEY: &[u8] = &[0x1b, 0x04];

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected command: expected Spawn, got {0}")]
    UnexpectedCommand(String),
    #[error("task runner error: {0}")]
    TaskRunner(#[from] TaskRunnerError),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `Spawn`, or the PTY was just allocated.
    Spawned,
    TasksRunningInPty,
    AwaitingTerminalHandoff,
    InteractiveLoop,
    Exited,
}

/// Coordination with a front-end that owns the terminal before the session.
pub struct TerminalHandoff {
    /// Signalled once pre-interactive setup is done.
    pub backend_done_tx: oneshot::Sender<()>,
    /// Resolves when the front-end has released the terminal.
    pub terminal_ready_rx: oneshot::Receiver<()>,
    /// Tasks to run inside the shell before handoff.
    pub task_rx: Option<mpsc::Receiver<PendingTask>>,
}

impl TerminalHandoff {
    fn release(self) {
        let _ = self.backend_done_tx.send(());
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub show_status_line: bool,
    /// Fixed terminal size. When set the real terminal is never queried and
    /// resize signals are ignored.
    pub size: Option<PtySize>,
    pub task_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            show_status_line: true,
            size: None,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

/// Injectable I/O for the shell session.
/// When fields are None, real stdin/stdout are used.
#[derive(Default)]
pub struct SessionIo {
    pub stdin: Option<Box<dyn Read + Send>>,
    pub stdout: Option<Box<dyn Write + Send>>,
    /// New terminal sizes as `(cols, rows)`. Replaces SIGWINCH handling.
    pub resize: Option<mpsc::Receiver<(u16, u16)>>,
}

/// Channels the interactive loop selects over.
struct LoopChannels<'a> {
    output: &'a mut mpsc::Receiver<PtyOutput>,
    commands: &'a mut mpsc::Receiver<SessionCommand>,
    stdin: mpsc::Receiver<Vec<u8>>,
    resize: mpsc::Receiver<(u16, u16)>,
    events: &'a mpsc::Sender<SessionEvent>,
}

pub struct ShellSession {
    config: SessionConfig,
    size: PtySize,
    status: StatusLine,
    state_tx: watch::Sender<SessionState>,
}

impl ShellSession {
    pub fn new(config: SessionConfig) -> Self {
        let size = config.size.unwrap_or_else(get_terminal_size);
        let status = StatusLine::new(config.show_status_line);
        let (state_tx, _) = watch::channel(SessionState::Spawned);
        Self {
            config,
            size,
            status,
            state_tx,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let prev = self.state_tx.send_replace(next);
        tracing::trace!("session: {:?} -> {:?}", prev, next);
    }

    /// PTY size: the terminal minus the status row.
    fn pty_size(&self) -> PtySize {
        PtySize {
            rows: self.status.content_rows(self.size.rows),
            ..self.size
        }
    }

    /// Run the session until the shell exits or the coordinator shuts down.
    ///
    /// `SessionEvent::Exited` is sent on every exit path, errors included.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        event_tx: mpsc::Sender<SessionEvent>,
        handoff: Option<TerminalHandoff>,
        io: SessionIo,
    ) -> Result<Option<u32>, SessionError> {
        let command = match command_rx.recv().await {
            Some(SessionCommand::Spawn {
                command,
                watch_paths,
            }) => {
                self.status.state_mut().set_watched_paths(watch_paths);
                command
            }
            Some(SessionCommand::Shutdown) | None => {
                if let Some(h) = handoff {
                    h.release();
                }
                self.transition(SessionState::Exited);
                return Ok(None);
            }
            Some(other) => {
                if let Some(h) = handoff {
                    h.release();
                }
                self.transition(SessionState::Exited);
                return Err(SessionError::UnexpectedCommand(format!("{other:?}")));
            }
        };

        let result = self.run_shell(command, command_rx, &event_tx, handoff, io).await;

        let exit_code = match &result {
            Ok(code) => *code,
            Err(e) => {
                tracing::error!("session: {}", e);
                None
            }
        };
        self.transition(SessionState::Exited);
        let _ = event_tx.send(SessionEvent::Exited { exit_code }).await;
        result
    }

    async fn run_shell(
        &mut self,
        command: CommandBuilder,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        event_tx: &mpsc::Sender<SessionEvent>,
        handoff: Option<TerminalHandoff>,
        io: SessionIo,
    ) -> Result<Option<u32>, SessionError> {
        // The PTY exists before the front-end lets go of the terminal so
        // tasks can start right away.
        let (mut pty, mut output) = match Pty::spawn(command, self.pty_size()) {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Some(h) = handoff {
                    h.release();
                }
                return Err(e.into());
            }
        };
        tracing::debug!("session: shell spawned");

        let mut replay = Vec::new();
        if let Some(mut handoff) = handoff {
            if let Some(mut task_rx) = handoff.task_rx.take() {
                self.transition(SessionState::TasksRunningInPty);
                let timeout = self.config.task_timeout;
                let status = &mut self.status;
                let outcome = {
                    let mut runner = PtyTaskRunner::new(&mut pty, &mut output, timeout);
                    tokio::select! {
                        result = runner.run(&mut task_rx) => Some(result),
                        () = wait_for_shutdown(&mut command_rx, status) => None,
                    }
                };
                match outcome {
                    Some(Ok(r)) => replay = r.into_bytes(),
                    Some(Err(TaskRunnerError::Io(e))) => {
                        handoff.release();
                        return Err(SessionError::Io(e));
                    }
                    // The interactive loop reports the exit if the shell is gone.
                    Some(Err(e)) => tracing::warn!("session: task phase ended early: {}", e),
                    None => {
                        tracing::debug!("session: shutdown requested while tasks were running");
                        // Interrupt the running task; dropping the PTY then
                        // ends the shell.
                        if let Err(e) = pty.write_all(&[0x03]) {
                            tracing::debug!("session: failed to interrupt task: {}", e);
                        }
                        handoff.release();
                        return Ok(None);
                    }
                }
            }

            self.transition(SessionState::AwaitingTerminalHandoff);
            let _ = handoff.backend_done_tx.send(());
            tracing::trace!("session: waiting for terminal release");
            let _ = handoff.terminal_ready_rx.await;
        }

        self.transition(SessionState::InteractiveLoop);
        let injected_stdin = io.stdin.is_some();
        let _raw_guard = if injected_stdin {
            None
        } else {
            Some(RawModeGuard::new()?)
        };
        let mut stdout: Box<dyn Write + Send> =
            io.stdout.unwrap_or_else(|| Box::new(io::stdout()));
        let stdin: Box<dyn Read + Send> = io.stdin.unwrap_or_else(|| Box::new(io::stdin()));

        if self.config.size.is_none()
            && let Ok((cols, rows)) = terminal::size()
        {
            self.size = PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            };
        }
        tracing::debug!("session: terminal size {}x{}", self.size.cols, self.size.rows);
        if let Err(e) = pty.resize(self.pty_size()) {
            tracing::warn!("session: {}", e);
        }

        self.status.install_scroll_region(&mut stdout, self.size.rows)?;
        stdout.write_all(&replay)?;
        self.status.draw(&mut stdout, self.size.cols, self.size.rows)?;
        stdout.flush()?;

        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        std::thread::spawn(move || read_stdin(stdin, stdin_tx));

        let (resize_rx, resize_task) = match io.resize {
            Some(rx) => (rx, None),
            None => {
                let (resize_tx, resize_rx) = mpsc::channel(4);
                let task = self
                    .config
                    .size
                    .is_none()
                    .then(|| tokio::spawn(listen_for_resize(resize_tx)));
                (resize_rx, task)
            }
        };

        let mut channels = LoopChannels {
            output: &mut output,
            commands: &mut command_rx,
            stdin: stdin_rx,
            resize: resize_rx,
            events: event_tx,
        };
        let result = self.event_loop(&mut pty, &mut channels, &mut stdout).await;

        if let Some(task) = resize_task {
            task.abort();
        }
        drop(pty);
        let _ = self.status.teardown(&mut stdout, self.size.rows);
        let _ = stdout.flush();
        result
    }

    /// Main event loop handling stdin, PTY output, resizes and coordinator
    /// commands. Returns the exit code of the shell, if available.
    async fn event_loop(
        &mut self,
        pty: &mut Pty,
        ch: &mut LoopChannels<'_>,
        stdout: &mut Box<dyn Write + Send>,
    ) -> Result<Option<u32>, SessionError> {
        let mut filter = OutputFilter::new();
        let mut spinner = tokio::time::interval(Duration::from_millis(SPINNER_INTERVAL_MS));
        spinner.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;
        let mut stdin_open = true;
        let mut resize_open = true;

        loop {
            let building = self.status.state().building;
            tokio::select! {
                out = ch.output.recv() => match out {
                    Some(PtyOutput::Data(data)) => self.forward_output(&data, &mut filter, stdout)?,
                    Some(PtyOutput::Closed) | None => {
                        let code = pty.exit_code().await;
                        tracing::debug!("session: shell exited with {:?}", code);
                        return Ok(code);
                    }
                },

                input = ch.stdin.recv(), if stdin_open => match input {
                    Some(data) if data == TOGGLE_PAUSE_KEY => {
                        if ch.events.try_send(SessionEvent::TogglePause).is_err() {
                            tracing::debug!("session: dropped pause toggle");
                        }
                    }
                    Some(data) => pty.write_all(&data)?,
                    None => stdin_open = false,
                },

                cmd = ch.commands.recv(), if commands_open => match cmd {
                    Some(SessionCommand::Shutdown) => {
                        tracing::debug!("session: shutdown requested");
                        return Ok(None);
                    }
                    Some(cmd) => self.handle_command(cmd, stdout)?,
                    None => commands_open = false,
                },

                resized = ch.resize.recv(), if resize_open => match resized {
                    Some((cols, rows)) => self.handle_resize(pty, cols, rows, ch.events, stdout)?,
                    None => resize_open = false,
                },

                _ = spinner.tick(), if building => {
                    self.status.advance_spinner();
                    self.status.draw(stdout, self.size.cols, self.size.rows)?;
                }
            }
        }
    }

    fn forward_output(
        &mut self,
        data: &[u8],
        filter: &mut OutputFilter,
        stdout: &mut Box<dyn Write + Send>,
    ) -> Result<(), SessionError> {
        let content_rows = self
            .status
            .is_enabled()
            .then(|| self.pty_size().rows);
        let filtered = filter.process(data, content_rows);
        stdout.write_all(&filtered.bytes)?;

        for event in filtered.events {
            match event {
                TerminalEvent::AltScreen(entered) => {
                    tracing::trace!("session: alternate screen {}", entered);
                    self.status.set_suspended(entered);
                }
                TerminalEvent::FullReset => {
                    self.status.install_scroll_region(stdout, self.size.rows)?;
                }
                TerminalEvent::ScrollRegionReset => {}
            }
        }

        // Redrawn after every chunk: clear-screen sequences wipe the row too.
        self.status.draw(stdout, self.size.cols, self.size.rows)?;
        stdout.flush()?;
        Ok(())
    }

    fn handle_command(
        &mut self,
        cmd: SessionCommand,
        stdout: &mut Box<dyn Write + Send>,
    ) -> Result<(), SessionError> {
        if apply_command(&mut self.status, cmd) {
            self.status.draw(stdout, self.size.cols, self.size.rows)?;
        }
        Ok(())
    }

    fn handle_resize(
        &mut self,
        pty: &Pty,
        cols: u16,
        rows: u16,
        events: &mpsc::Sender<SessionEvent>,
        stdout: &mut Box<dyn Write + Send>,
    ) -> Result<(), SessionError> {
        if cols == self.size.cols && rows == self.size.rows {
            return Ok(());
        }
        self.size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        if let Err(e) = pty.resize(self.pty_size()) {
            tracing::warn!("session: {}", e);
        }
        self.status.install_scroll_region(stdout, rows)?;
        self.status.draw(stdout, cols, rows)?;
        // Observers only; never block the copy loop on them.
        let _ = events.try_send(SessionEvent::Resized { cols, rows });
        Ok(())
    }
}

/// Update the status state for `cmd`. Returns whether the status line
/// needs a redraw.
fn apply_command(status: &mut StatusLine, cmd: SessionCommand) -> bool {
    tracing::trace!("session: command {:?}", cmd);
    let state = status.state_mut();
    match cmd {
        SessionCommand::WatchedPaths { paths } => state.set_watched_paths(paths),
        SessionCommand::Building { changed_paths } => state.set_building(changed_paths),
        SessionCommand::ReloadReady { changed_paths } => state.set_reload_ready(changed_paths),
        SessionCommand::BuildFailed {
            changed_paths,
            message,
        } => state.set_build_failed(changed_paths, message),
        SessionCommand::ReloadApplied => state.clear(),
        SessionCommand::WatchingPaused { paused } => state.set_paused(paused),
        SessionCommand::Spawn { .. } => {
            tracing::warn!("session: ignoring Spawn for a running shell");
            return false;
        }
        // Handled by the callers.
        SessionCommand::Shutdown => return false,
    }
    true
}

/// Resolves once the coordinator asks for shutdown. Other commands update
/// the status state; it is drawn when the interactive loop starts.
async fn wait_for_shutdown(commands: &mut mpsc::Receiver<SessionCommand>, status: &mut StatusLine) {
    while let Some(cmd) = commands.recv().await {
        if matches!(cmd, SessionCommand::Shutdown) {
            return;
        }
        apply_command(status, cmd);
    }
    // A closed channel leaves the shell running, as in the interactive loop.
    std::future::pending::<()>().await
}

fn read_stdin(mut stdin: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("session: stdin read error: {}", e);
                break;
            }
        }
    }
}

async fn listen_for_resize(tx: mpsc::Sender<(u16, u16)>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("session: cannot listen for SIGWINCH: {}", e);
            return;
        }
    };
    while winch.recv().await.is_some() {
        let Ok(size) = terminal::size() else {
            continue;
        };
        if tx.send(size).await.is_err() {
            break;
        }
    }
}
