#![allow(dead_code)]

use reshell_reload::{
    BuildContext, BuildError, CommandBuilder, Config, CoordinatorError, SessionCommand,
    SessionEvent, ShellBuilder, ShellCoordinator, ShellSpec,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a temporary directory with specified files
pub fn create_temp_dir_with_files(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("create temp dir");
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, content).expect("write content");
    }
    dir
}

/// Replace a file's content in one step so the watcher never hashes a
/// half-written file.
pub fn modify_file(path: &Path, content: &str) {
    let dir = path.parent().expect("parent dir");
    let mut file = tempfile::NamedTempFile::new_in(dir).expect("temp file");
    file.write_all(content.as_bytes()).expect("write");
    file.as_file().sync_all().expect("sync");
    file.persist(path).expect("persist");
}

/// Builder whose reload builds take `delay`, copy the content of `source`
/// into the environment script and report `extra_watch` as inputs.
#[derive(Clone)]
pub struct MockBuilder {
    pub source: PathBuf,
    pub delay: Duration,
    pub honor_cancel: bool,
    pub fail_initial: bool,
    pub fail_next: Arc<Mutex<Option<String>>>,
    pub extra_watch: Arc<Mutex<Vec<PathBuf>>>,
    pub reload_builds: Arc<AtomicUsize>,
}

impl MockBuilder {
    pub fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            delay: Duration::ZERO,
            honor_cancel: true,
            fail_initial: false,
            fail_next: Arc::new(Mutex::new(None)),
            extra_watch: Arc::new(Mutex::new(Vec::new())),
            reload_builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ignoring_cancellation(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn failing_initial(mut self) -> Self {
        self.fail_initial = true;
        self
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_extra_watch(&self, paths: Vec<PathBuf>) {
        *self.extra_watch.lock().unwrap() = paths;
    }

    pub fn reload_builds(&self) -> usize {
        self.reload_builds.load(Ordering::SeqCst)
    }
}

impl ShellBuilder for MockBuilder {
    fn build(&self, _ctx: &BuildContext) -> Result<ShellSpec, BuildError> {
        if self.fail_initial {
            return Err(BuildError::new("intentional test failure"));
        }
        let mut command = CommandBuilder::new("sh");
        command.arg("-c");
        command.arg("sleep 60");
        Ok(ShellSpec {
            command,
            watch_paths: self.extra_watch.lock().unwrap().clone(),
        })
    }

    fn build_reload_env(&self, ctx: &BuildContext) -> Result<Vec<PathBuf>, BuildError> {
        self.reload_builds.fetch_add(1, Ordering::SeqCst);
        let content = std::fs::read_to_string(&self.source)
            .map_err(|e| BuildError::new(format!("read source: {e}")))?;

        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if self.honor_cancel && ctx.is_cancelled() {
                return Err(BuildError::cancelled());
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(BuildError::new(message));
        }

        ctx.stage_artifact(format!("export CONTENT='{}'\n", content.trim()).as_bytes())?;
        Ok(self.extra_watch.lock().unwrap().clone())
    }
}

/// A coordinator running in the background with the session side exposed.
pub struct Harness {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub events: mpsc::Sender<SessionEvent>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), CoordinatorError>>,
}

impl Harness {
    pub fn start<B: ShellBuilder + 'static>(config: Config, builder: B) -> Self {
        let (command_tx, commands) = mpsc::channel(32);
        let (events, event_rx) = mpsc::channel(32);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            ShellCoordinator::run(config, builder, command_tx, event_rx, token).await
        });
        Self {
            commands,
            events,
            shutdown,
            handle,
        }
    }

    pub async fn next(&mut self) -> SessionCommand {
        tokio::time::timeout(TEST_TIMEOUT, self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("command channel closed")
    }

    /// Consume `Spawn` and the following `WatchedPaths`; returns the paths.
    pub async fn started(&mut self) -> Vec<PathBuf> {
        match self.next().await {
            SessionCommand::Spawn { .. } => {}
            other => panic!("expected Spawn, got {:?}", other),
        }
        match self.next().await {
            SessionCommand::WatchedPaths { paths } => paths,
            other => panic!("expected WatchedPaths, got {:?}", other),
        }
    }

    /// Skip `Building` and `WatchedPaths` notices up to the next build result.
    /// Returns the result and the number of `Building` notices skipped.
    pub async fn next_outcome(&mut self) -> (SessionCommand, usize) {
        let mut building = 0;
        loop {
            match self.next().await {
                SessionCommand::Building { .. } => building += 1,
                SessionCommand::WatchedPaths { .. } => {}
                cmd @ (SessionCommand::ReloadReady { .. }
                | SessionCommand::BuildFailed { .. }) => return (cmd, building),
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    /// Assert that no command arrives for `window`.
    pub async fn expect_quiet(&mut self, window: Duration) {
        if let Ok(cmd) = tokio::time::timeout(window, self.commands.recv()).await {
            panic!("expected no command, got {:?}", cmd);
        }
    }
}
