//! Rebuild coordination.
//!
//! The coordinator owns the watch set and the in-flight build. It turns file
//! changes into builds and build results into [`SessionCommand`]s for the
//! shell session; it never touches the terminal or the live shell.

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::builder::{BuildContext, BuildError, BuildOutcome, BuildTrigger, ShellBuilder};
use crate::config::Config;
use reshell_file_watcher::{
    ChangeEvent, FileWatcher, FileWatcherConfig, WatcherHandle, normalize_path,
};
use reshell_shell::{SessionCommand, SessionEvent};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("build failed: {0}")]
    Build(#[source] BuildError),
    #[error("channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rebuild returned from the blocking pool.
struct BuildFinished {
    generation: u64,
    staged: PathBuf,
    result: Result<Vec<PathBuf>, BuildError>,
}

/// Coordinates builds and file watching for one interactive shell.
///
/// The session owns the PTY; the coordinator only sends it commands and
/// listens for its events.
pub struct ShellCoordinator;

impl ShellCoordinator {
    /// Run until the shell exits, the session goes away or `shutdown` fires.
    ///
    /// Performs the initial build, sends `Spawn`, then reacts to file
    /// changes. A failing initial build is returned as an error; later
    /// failures are reported to the session and leave the shell's current
    /// environment in place.
    pub async fn run<B: ShellBuilder + 'static>(
        config: Config,
        builder: B,
        command_tx: mpsc::Sender<SessionCommand>,
        mut event_rx: mpsc::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), CoordinatorError> {
        let cwd = normalize_path(&std::env::current_dir()?);
        let artifacts = ArtifactStore::new(&config.reload_file)?;

        let base_paths: BTreeSet<PathBuf> = config
            .watch_files
            .iter()
            .map(|p| normalize_path(&cwd.join(p)))
            .collect();

        let mut watcher = FileWatcher::new(
            FileWatcherConfig {
                paths: base_paths.iter().cloned().collect(),
                ..Default::default()
            },
            "reshell-reload",
        )
        .await;

        let (build_tx, mut build_rx) = mpsc::channel::<BuildFinished>(16);

        let mut state = CoordinatorState {
            builder: Arc::new(builder),
            cwd,
            watched: base_paths.clone(),
            base_paths,
            watcher: watcher.handle(),
            artifacts,
            command_tx: command_tx.clone(),
            build_tx,
            shutdown: shutdown.clone(),
            generation: 0,
            in_flight: None,
            pending_changes: Vec::new(),
            hashes: HashMap::new(),
            reload_pending: false,
            paused: false,
            deferred: Vec::new(),
        };

        // Initial build, off the async workers since builders may block.
        let ctx = state.context(BuildTrigger::Initial, 0, shutdown.child_token());
        let builder = state.builder.clone();
        let initial = tokio::select! {
            result = tokio::task::spawn_blocking(move || builder.build(&ctx)) => result,
            _ = shutdown.cancelled() => {
                tracing::debug!("coordinator: shutdown during initial build");
                return Ok(());
            }
        };
        let spec = initial
            .unwrap_or_else(|e| Err(BuildError::new(format!("build task panicked: {e}"))))
            .map_err(CoordinatorError::Build)?;

        state.sync_watch_set(&spec.watch_paths).await;
        let watch_paths = state.watcher.watched_paths().await;
        state
            .send(SessionCommand::Spawn {
                command: spec.command,
                watch_paths: watch_paths.clone(),
            })
            .await?;
        state
            .send(SessionCommand::WatchedPaths { paths: watch_paths })
            .await?;

        let mut reload_check = tokio::time::interval(config.reload_poll);
        reload_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("coordinator: shutdown requested");
                    break;
                }
                Some(change) = watcher.recv() => state.on_change(change).await,
                Some(finished) = build_rx.recv() => state.on_build_finished(finished).await,
                event = event_rx.recv() => match event {
                    Some(SessionEvent::Exited { exit_code }) => {
                        tracing::debug!("coordinator: shell exited with {:?}", exit_code);
                        break;
                    }
                    Some(SessionEvent::Resized { cols, rows }) => {
                        tracing::trace!("coordinator: terminal resized to {}x{}", cols, rows);
                        Ok(())
                    }
                    Some(SessionEvent::TogglePause) => state.toggle_pause().await,
                    None => break,
                },
                _ = reload_check.tick(), if state.reload_pending => {
                    state.check_reload_applied().await
                }
            };

            match step {
                Ok(()) => {}
                Err(CoordinatorError::ChannelClosed) => {
                    tracing::debug!("coordinator: session went away");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        state.cancel_in_flight();
        let _ = command_tx.send(SessionCommand::Shutdown).await;
        Ok(())
    }
}

struct CoordinatorState<B> {
    builder: Arc<B>,
    cwd: PathBuf,
    /// Paths from the configuration; always watched.
    base_paths: BTreeSet<PathBuf>,
    /// Current watch set: the base paths plus the last build's inputs.
    watched: BTreeSet<PathBuf>,
    watcher: WatcherHandle,
    artifacts: ArtifactStore,
    command_tx: mpsc::Sender<SessionCommand>,
    build_tx: mpsc::Sender<BuildFinished>,
    shutdown: CancellationToken,
    /// Number of the most recent build; only its result is applied.
    generation: u64,
    in_flight: Option<CancellationToken>,
    /// Files changed since the last completed build
    pending_changes: Vec<PathBuf>,
    /// Hash of each file when it last triggered a build
    hashes: HashMap<PathBuf, blake3::Hash>,
    /// A published environment is waiting for the shell
    reload_pending: bool,
    paused: bool,
    /// Latest change per path seen while paused, replayed on resume.
    deferred: Vec<ChangeEvent>,
}

impl<B: ShellBuilder + 'static> CoordinatorState<B> {
    fn context(
        &self,
        trigger: BuildTrigger,
        generation: u64,
        cancel: CancellationToken,
    ) -> BuildContext {
        BuildContext {
            cwd: self.cwd.clone(),
            trigger,
            generation,
            reload_file: self.artifacts.reload_file().to_path_buf(),
            staged_artifact: self.artifacts.staging_path(generation),
            cancel,
        }
    }

    async fn send(&self, command: SessionCommand) -> Result<(), CoordinatorError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)
    }

    fn relative_changes(&self) -> Vec<PathBuf> {
        self.pending_changes
            .iter()
            .map(|p| p.strip_prefix(&self.cwd).unwrap_or(p).to_path_buf())
            .collect()
    }

    fn cancel_in_flight(&mut self) {
        if let Some(cancel) = self.in_flight.take() {
            tracing::debug!("coordinator: cancelling build {}", self.generation);
            cancel.cancel();
        }
    }

    async fn on_change(&mut self, change: ChangeEvent) -> Result<(), CoordinatorError> {
        if self.paused {
            tracing::debug!("coordinator: paused, deferring change to {}", change.path.display());
            self.deferred.retain(|c| c.path != change.path);
            self.deferred.push(change);
            return Ok(());
        }
        if self.record_change(change) {
            self.start_build().await?;
        }
        Ok(())
    }

    /// Add a change to the pending set. Returns false when the content is
    /// what the last build already saw.
    fn record_change(&mut self, change: ChangeEvent) -> bool {
        let ChangeEvent { path, content_hash } = change;
        if self.hashes.get(&path) == Some(&content_hash) {
            tracing::debug!("coordinator: {} unchanged since last build", path.display());
            return false;
        }
        self.hashes.insert(path.clone(), content_hash);
        tracing::debug!("coordinator: {} changed", path.display());
        if !self.pending_changes.contains(&path) {
            self.pending_changes.push(path);
        }
        true
    }

    /// Start a build for the pending changes, superseding any in flight.
    async fn start_build(&mut self) -> Result<(), CoordinatorError> {
        // A newer environment is on its way; whatever is published is stale.
        self.reload_pending = false;
        self.cancel_in_flight();
        self.generation += 1;
        let generation = self.generation;
        let cancel = self.shutdown.child_token();
        self.in_flight = Some(cancel.clone());

        self.send(SessionCommand::Building {
            changed_paths: self.relative_changes(),
        })
        .await?;

        let ctx = self.context(
            BuildTrigger::FilesChanged(self.pending_changes.clone()),
            generation,
            cancel,
        );
        self.spawn_build(ctx);
        Ok(())
    }

    fn spawn_build(&self, ctx: BuildContext) {
        let builder = self.builder.clone();
        let build_tx = self.build_tx.clone();
        tokio::spawn(async move {
            let generation = ctx.generation;
            let staged = ctx.staged_artifact.clone();
            let result = tokio::task::spawn_blocking(move || builder.build_reload_env(&ctx))
                .await
                .unwrap_or_else(|e| Err(BuildError::new(format!("build task panicked: {e}"))));
            let finished = BuildFinished {
                generation,
                staged,
                result,
            };
            if let Err(mpsc::error::SendError(finished)) = build_tx.send(finished).await {
                tracing::debug!(
                    "coordinator: gone before build {} finished; dropping its result",
                    finished.generation
                );
                let _ = std::fs::remove_file(&finished.staged);
            }
        });
    }

    async fn on_build_finished(&mut self, finished: BuildFinished) -> Result<(), CoordinatorError> {
        let BuildFinished {
            generation,
            staged,
            result,
        } = finished;

        if generation != self.generation || self.in_flight.is_none() {
            match &result {
                Ok(_) => tracing::warn!(
                    "coordinator: build {} finished after being superseded; discarding it",
                    generation
                ),
                Err(e) => tracing::debug!("coordinator: superseded build {} ended: {}", generation, e),
            }
            self.artifacts.discard(&staged);
            return Ok(());
        }

        self.in_flight = None;
        let changed_paths = self.relative_changes();
        self.pending_changes.clear();

        let outcome = match result {
            Ok(new_watch_paths) => BuildOutcome::Success {
                artifact_path: staged,
                new_watch_paths,
            },
            Err(e) => {
                self.artifacts.discard(&staged);
                BuildOutcome::Failure {
                    message: e.full_message(),
                }
            }
        };
        self.apply_outcome(outcome, changed_paths).await
    }

    async fn apply_outcome(
        &mut self,
        outcome: BuildOutcome,
        changed_paths: Vec<PathBuf>,
    ) -> Result<(), CoordinatorError> {
        match outcome {
            BuildOutcome::Success {
                artifact_path,
                new_watch_paths,
            } => {
                if let Err(e) = self.artifacts.publish(&artifact_path) {
                    self.artifacts.discard(&artifact_path);
                    return self.report_failure(changed_paths, e.to_string()).await;
                }
                tracing::info!("coordinator: build {} ready", self.generation);

                let watch_set_changed = self.sync_watch_set(&new_watch_paths).await;
                self.reload_pending = true;
                self.send(SessionCommand::ReloadReady { changed_paths }).await?;

                if watch_set_changed {
                    let paths = self.watcher.watched_paths().await;
                    self.send(SessionCommand::WatchedPaths { paths }).await?;
                }
                Ok(())
            }
            BuildOutcome::Failure { message } => self.report_failure(changed_paths, message).await,
        }
    }

    async fn report_failure(
        &self,
        changed_paths: Vec<PathBuf>,
        message: String,
    ) -> Result<(), CoordinatorError> {
        tracing::warn!("coordinator: build {} failed: {}", self.generation, message);
        self.send(SessionCommand::BuildFailed {
            changed_paths,
            message,
        })
        .await
    }

    /// Replace the build-reported part of the watch set with `inputs`.
    /// Returns whether the set changed.
    async fn sync_watch_set(&mut self, inputs: &[PathBuf]) -> bool {
        let mut desired = self.base_paths.clone();
        desired.extend(inputs.iter().map(|p| normalize_path(&self.cwd.join(p))));

        let removed: Vec<PathBuf> = self.watched.difference(&desired).cloned().collect();
        let added: Vec<PathBuf> = desired.difference(&self.watched).cloned().collect();

        for path in &removed {
            self.watcher.unwatch(path).await;
            self.hashes.remove(path);
        }
        for path in &added {
            // Non-fatal: a missed path only means a missed reload.
            if let Err(e) = self.watcher.watch(path).await {
                tracing::warn!("coordinator: {}", e);
            }
        }

        self.watched = desired;
        !(removed.is_empty() && added.is_empty())
    }

    async fn check_reload_applied(&mut self) -> Result<(), CoordinatorError> {
        if self.artifacts.is_pending() {
            return Ok(());
        }
        tracing::debug!("coordinator: shell applied the reload");
        self.reload_pending = false;
        self.send(SessionCommand::ReloadApplied).await
    }

    async fn toggle_pause(&mut self) -> Result<(), CoordinatorError> {
        self.paused = !self.paused;
        tracing::debug!(
            "coordinator: file watching {}",
            if self.paused { "paused" } else { "resumed" }
        );
        self.send(SessionCommand::WatchingPaused {
            paused: self.paused,
        })
        .await?;
        if self.paused {
            return Ok(());
        }

        let mut dirty = false;
        for change in std::mem::take(&mut self.deferred) {
            dirty |= self.record_change(change);
        }
        if dirty {
            tracing::debug!("coordinator: rebuilding for changes made while paused");
            self.start_build().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_error_display() {
        let err = CoordinatorError::ChannelClosed;
        assert_eq!(format!("{}", err), "channel closed");

        let err = CoordinatorError::Build(BuildError::new("bad input"));
        assert_eq!(format!("{}", err), "build failed: bad input");
    }

    #[test]
    fn test_artifact_error_is_transparent() {
        let err = CoordinatorError::from(ArtifactError::Missing(PathBuf::from("/s/x.tmp")));
        assert_eq!(format!("{}", err), "build produced no environment at /s/x.tmp");
    }
}
