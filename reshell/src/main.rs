mod builder;
mod cli;
mod config;
mod frontend;
mod log;
mod shutdown;

use builder::ScriptBuilder;
use clap::Parser;
use cli::Cli;
use config::{FileConfig, Settings};
use frontend::Frontend;
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use reshell_reload::{CoordinatorError, ShellCoordinator};
use reshell_shell::{SessionConfig, SessionIo, ShellSession, TerminalHandoff};
use reshell_tasks::{PtyExecutor, TaskRunner, check_outcomes};
use shutdown::Shutdown;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitCode};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().into_diagnostic()?;
    let (file, config_path) = FileConfig::load(cli.config.as_deref(), &cwd)?;
    let settings = Settings::resolve(&cli, file, config_path, cwd)?;

    let state_dir = tempfile::Builder::new()
        .prefix(&format!("reshell-{}-", std::process::id()))
        .tempdir()
        .into_diagnostic()
        .wrap_err("Failed to create state directory")?;

    // The interactive session owns the terminal in hot-reload mode.
    let log_file = match (&cli.log_file, settings.reload) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(state_dir.path().join("reshell.log")),
        (None, false) => None,
    };
    log::init_tracing(cli.log_level(), cli.log_format, log_file.as_deref())
        .into_diagnostic()
        .wrap_err("Failed to open log file")?;

    let shutdown = Shutdown::new();
    shutdown
        .install_signals()
        .into_diagnostic()
        .wrap_err("Failed to install signal handlers")?;

    let frontend = Frontend::new(cli.verbose);
    if settings.reload {
        run_reload(settings, state_dir, frontend, shutdown).await
    } else {
        run_static(settings, state_dir, frontend, shutdown).await
    }
}

async fn run_reload(
    settings: Settings,
    state_dir: TempDir,
    frontend: Frontend,
    shutdown: Arc<Shutdown>,
) -> Result<ExitCode> {
    let reload_file = settings
        .reload_file
        .clone()
        .unwrap_or_else(|| state_dir.path().join("reload.sh"));
    tracing::info!(
        "Starting {} in {} (reload file {})",
        settings.shell.display(),
        settings.cwd.display(),
        reload_file.display()
    );

    let builder = ScriptBuilder::new(
        &settings.build,
        &settings.shell,
        state_dir.path(),
        settings.tasks_in_shell(),
    );
    let config = reshell_reload::Config::new(settings.watch.clone(), reload_file);

    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(32);
    let (backend_done_tx, backend_done_rx) = oneshot::channel();
    let (terminal_ready_tx, terminal_ready_rx) = oneshot::channel();
    let (task_tx, task_rx) = if settings.tasks_in_shell() {
        let (tx, rx) = mpsc::channel(1);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    frontend.building(&settings.build);

    let coordinator = tokio::spawn(ShellCoordinator::run(
        config,
        builder,
        command_tx,
        event_rx,
        shutdown.cancellation_token(),
    ));

    let session = ShellSession::new(SessionConfig {
        show_status_line: settings.status_line,
        size: None,
        task_timeout: settings.task_timeout,
    });
    let handoff = TerminalHandoff {
        backend_done_tx,
        terminal_ready_rx,
        task_rx,
    };
    let session = tokio::spawn(session.run(
        command_rx,
        event_tx,
        Some(handoff),
        SessionIo::default(),
    ));

    frontend.running_tasks(settings.tasks.len());
    let mut runner = TaskRunner::new(settings.tasks, shutdown.cancellation_token());
    if let Some(tx) = task_tx {
        runner = runner.with_pty(PtyExecutor::new(tx));
    }
    // Consuming the runner closes the task channel, which ends the session's
    // task phase.
    match runner.run(&frontend).await {
        Ok(outcomes) => {
            frontend.report(&outcomes);
            if let Err(e) = check_outcomes(&outcomes) {
                tracing::warn!("{}", e);
            }
        }
        Err(e) => frontend.error(&format!("Setup tasks failed: {e}")),
    }

    frontend.hand_off(backend_done_rx, terminal_ready_tx).await;

    let session_result = session.await.into_diagnostic()?;
    match coordinator.await.into_diagnostic()? {
        Ok(()) => {}
        Err(CoordinatorError::Build(e)) => {
            return Err(miette!("{}", e.full_message())).wrap_err("Failed to build environment");
        }
        Err(e) => return Err(e).into_diagnostic(),
    }

    let exit_code = session_result.into_diagnostic()?;
    if let Some(code) = shutdown.exit_code() {
        return Ok(ExitCode::from(code));
    }
    Ok(ExitCode::from(exit_code.unwrap_or(0).min(255) as u8))
}

/// Build once, run every task as a subprocess and exec the shell.
async fn run_static(
    settings: Settings,
    state_dir: TempDir,
    frontend: Frontend,
    shutdown: Arc<Shutdown>,
) -> Result<ExitCode> {
    let builder = ScriptBuilder::new(&settings.build, &settings.shell, state_dir.path(), false);

    frontend.building(&settings.build);
    let output = builder
        .run(&settings.cwd, &shutdown.cancellation_token())
        .map_err(|e| miette!("{}", e.full_message()))
        .wrap_err("Failed to build environment")?;
    let rcfile = builder
        .write_rcfile(&output.script, false, true)
        .map_err(|e| miette!("{}", e.full_message()))?;

    frontend.running_tasks(settings.tasks.len());
    let outcomes = TaskRunner::new(settings.tasks, shutdown.cancellation_token())
        .run(&frontend)
        .await
        .into_diagnostic()?;
    frontend.report(&outcomes);
    if let Err(e) = check_outcomes(&outcomes) {
        tracing::warn!("{}", e);
    }

    if let Some(code) = shutdown.exit_code() {
        return Ok(ExitCode::from(code));
    }

    // The shell removes the state directory once it has read its init files.
    let state_dir = state_dir.keep();
    tracing::debug!("exec {} {:?}", settings.shell.display(), rcfile);
    let err = Command::new(builder.shell())
        .args(builder.shell_args(&rcfile))
        .current_dir(&settings.cwd)
        .exec();
    let _ = std::fs::remove_dir_all(&state_dir);
    Err(err)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to exec {}", settings.shell.display()))
}
