//! Content-aware file watcher.
//!
//! Observes a mutable set of paths and emits a [`ChangeEvent`] only when the
//! content hash of a path differs from the one last recorded for it. Paths
//! can be added and removed at runtime through a clone-able [`WatcherHandle`].
//!
//! All bookkeeping lives in a single task that owns the OS watcher; handles
//! talk to it over a channel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("file watcher is not running")]
    Unavailable,
    #[error("failed to watch path {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// A path whose content changed, with the hash of the new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub content_hash: blake3::Hash,
}

pub struct FileWatcherConfig {
    pub paths: Vec<PathBuf>,
    /// Capacity of the change event channel.
    pub capacity: usize,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            capacity: 100,
        }
    }
}

enum Request {
    Watch(PathBuf, oneshot::Sender<Result<(), WatcherError>>),
    Unwatch(PathBuf, oneshot::Sender<()>),
    List(oneshot::Sender<Vec<PathBuf>>),
}

/// Clone-able handle for changing the watched set at runtime.
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl WatcherHandle {
    /// Start observing `path`.
    ///
    /// Files are observed through their parent directory so editors that
    /// save by renaming a temporary file are still noticed. Directories are
    /// observed recursively.
    pub async fn watch(&self, path: &Path) -> Result<(), WatcherError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Watch(path.to_path_buf(), tx))
            .map_err(|_| WatcherError::Unavailable)?;
        rx.await.map_err(|_| WatcherError::Unavailable)?
    }

    /// Stop observing `path`. Unknown paths are ignored.
    pub async fn unwatch(&self, path: &Path) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Request::Unwatch(path.to_path_buf(), tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Paths currently observed, sorted.
    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Request::List(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Resolve symlinks so paths compare equal to what the OS reports.
///
/// Paths that do not exist yet are resolved through their parent.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

async fn hash_file(path: &Path) -> Option<blake3::Hash> {
    let content = tokio::fs::read(path).await.ok()?;
    Some(blake3::hash(&content))
}

struct WatchState {
    name: String,
    watcher: Option<RecommendedWatcher>,
    /// Individually watched files.
    files: HashSet<PathBuf>,
    /// Recursively watched directories.
    trees: HashSet<PathBuf>,
    /// Parent directories registered with the OS, with the number of
    /// watched files inside each.
    parents: HashMap<PathBuf, usize>,
    /// Last observed content hash per path.
    hashes: HashMap<PathBuf, blake3::Hash>,
}

impl WatchState {
    async fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let key = normalize_path(path);
        if self.watcher.is_none() {
            warn!("{}: cannot watch {}: watcher unavailable", self.name, key.display());
            return Err(WatcherError::Unavailable);
        }

        if key.is_dir() {
            if self.trees.contains(&key) {
                return Ok(());
            }
            if !self.covered_by_tree(&key)
                && let Some(watcher) = self.watcher.as_mut()
            {
                watcher
                    .watch(&key, RecursiveMode::Recursive)
                    .map_err(|source| WatcherError::Watch {
                        path: key.clone(),
                        source,
                    })?;
            }
            self.trees.insert(key);
            return Ok(());
        }

        if self.files.contains(&key) {
            return Ok(());
        }
        let parent = key
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let count = self.parents.get(&parent).copied().unwrap_or(0);
        if count == 0
            && !self.covered_by_tree(&parent)
            && let Some(watcher) = self.watcher.as_mut()
        {
            watcher
                .watch(&parent, RecursiveMode::NonRecursive)
                .map_err(|source| WatcherError::Watch {
                    path: key.clone(),
                    source,
                })?;
        }
        self.parents.insert(parent, count + 1);

        // Record the baseline so a touch without a content change is dropped.
        if let Some(hash) = hash_file(&key).await {
            self.hashes.insert(key.clone(), hash);
        }
        self.files.insert(key);
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) {
        let key = normalize_path(path);
        if self.trees.remove(&key) {
            self.hashes
                .retain(|p, _| !p.starts_with(&key) || self.files.contains(p));
            if self.covered_by_tree(&key) {
                return;
            }
            self.os_unwatch(&key);
            self.rewatch_under(&key);
            return;
        }
        if !self.files.remove(&key) {
            return;
        }
        self.hashes.remove(&key);

        let Some(parent) = key.parent().map(Path::to_path_buf) else {
            return;
        };
        let remaining = self.parents.get(&parent).copied().unwrap_or(1) - 1;
        if remaining > 0 {
            self.parents.insert(parent, remaining);
            return;
        }
        self.parents.remove(&parent);
        // A tree still needs the OS watch on this directory.
        if !self.covered_by_tree(&parent) {
            self.os_unwatch(&parent);
        }
    }

    /// Whether `dir` is inside, or is, a recursively watched directory.
    fn covered_by_tree(&self, dir: &Path) -> bool {
        self.trees.iter().any(|tree| dir.starts_with(tree))
    }

    fn os_unwatch(&mut self, path: &Path) {
        if let Some(watcher) = self.watcher.as_mut()
            && let Err(e) = watcher.unwatch(path)
        {
            debug!("{}: unwatch {} failed: {}", self.name, path.display(), e);
        }
    }

    /// Register again the trees and file parents below `root`, whose OS
    /// watches went away together with the tree at `root`.
    fn rewatch_under(&mut self, root: &Path) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        let trees: Vec<PathBuf> = self
            .trees
            .iter()
            .filter(|tree| tree.starts_with(root))
            .cloned()
            .collect();
        for tree in &trees {
            let nested = trees.iter().any(|other| other != tree && tree.starts_with(other));
            if nested {
                continue;
            }
            if let Err(e) = watcher.watch(tree, RecursiveMode::Recursive) {
                warn!("{}: failed to rewatch {}: {}", self.name, tree.display(), e);
            }
        }
        for parent in self.parents.keys() {
            if !parent.starts_with(root) || trees.iter().any(|tree| parent.starts_with(tree)) {
                continue;
            }
            if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                warn!("{}: failed to rewatch {}: {}", self.name, parent.display(), e);
            }
        }
    }

    fn list(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.iter().chain(self.trees.iter()).cloned().collect();
        paths.sort();
        paths
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.files.contains(path) || self.trees.iter().any(|t| path.starts_with(t))
    }

    /// Returns the change events produced by one OS notification.
    async fn changes(&mut self, event: Event) -> Vec<ChangeEvent> {
        if !(event.kind.is_modify() || event.kind.is_create()) {
            return Vec::new();
        }

        let mut changes = Vec::new();
        for path in event.paths {
            if !self.is_watched(&path) {
                continue;
            }
            let Some(hash) = hash_file(&path).await else {
                debug!("{}: could not read {}", self.name, path.display());
                continue;
            };
            if self.hashes.get(&path) == Some(&hash) {
                trace!("{}: unchanged content: {}", self.name, path.display());
                continue;
            }
            self.hashes.insert(path.clone(), hash);
            changes.push(ChangeEvent {
                path,
                content_hash: hash,
            });
        }
        changes
    }
}

/// File watcher emitting deduplicated [`ChangeEvent`]s.
///
/// Dropping the watcher stops the background task and releases every OS
/// watch it holds.
pub struct FileWatcher {
    rx: mpsc::Receiver<ChangeEvent>,
    // Kept alive so rx.recv() stays pending instead of returning None
    // when the background task is gone.
    _tx: mpsc::Sender<ChangeEvent>,
    handle: WatcherHandle,
    task: JoinHandle<()>,
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FileWatcher {
    /// Create a watcher for the configured paths.
    ///
    /// Infallible: paths that cannot be observed are logged and skipped, and
    /// if the OS watcher itself cannot be created `recv()` never yields.
    pub async fn new(config: FileWatcherConfig, name: &str) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Request>();

        let watcher = match notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        }) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("Failed to create file watcher for {}: {}", name, e);
                None
            }
        };

        let mut state = WatchState {
            name: name.to_owned(),
            watcher,
            files: HashSet::new(),
            trees: HashSet::new(),
            parents: HashMap::new(),
            hashes: HashMap::new(),
        };

        for path in &config.paths {
            if let Err(e) = state.watch(path).await {
                warn!("{}: {}", name, e);
            }
        }
        info!("File watcher started for {} watching {:?}", name, state.list());

        let events_tx = tx.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(request) = req_rx.recv() => match request {
                        Request::Watch(path, reply) => {
                            let result = state.watch(&path).await;
                            if let Err(ref e) = result {
                                warn!("{}: {}", state.name, e);
                            }
                            let _ = reply.send(result);
                        }
                        Request::Unwatch(path, reply) => {
                            state.unwatch(&path);
                            let _ = reply.send(());
                        }
                        Request::List(reply) => {
                            let _ = reply.send(state.list());
                        }
                    },
                    Some(result) = raw_rx.recv() => match result {
                        Ok(event) => {
                            for change in state.changes(event).await {
                                debug!("{}: content changed: {}", state.name, change.path.display());
                                if events_tx.send(change).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!("{}: watch error: {}", state.name, e),
                    },
                    else => break,
                }
            }
        });

        Self {
            rx,
            _tx: tx,
            handle: WatcherHandle { tx: req_tx },
            task,
        }
    }

    pub fn handle(&self) -> WatcherHandle {
        self.handle.clone()
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}
