use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, error, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Trait for objects that can be hot-reloaded from disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls one directory tree and forwards relevant changes to a [`WatchedType`].
///
/// Events are handled one at a time, in the order they were observed.
/// Dropping the watcher stops polling; `shutdown()` also stops the dispatch task.
pub struct DirectoryWatcher {
    dir: PathBuf,
    _watcher: PollWatcher,
    handle: JoinHandle<()>,
}

impl DirectoryWatcher {
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        Self::with_interval(dir, watcher_impl, exts, initial_scan, enable_retry, DEFAULT_POLL_INTERVAL).await
    }

    /// Start watching `dir` for paths with one of `exts`, or any path
    /// `is_relevant` accepts. With `initial_scan`, existing entries are
    /// reloaded first; with `enable_retry`, failed initial reloads are retried.
    pub async fn with_interval(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }
        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if accepts(watcher_impl.as_ref(), &path, &exts) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        let (tx, rx): (_, UnboundedReceiver<notify::Result<Event>>) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listening any more
                let _ = tx.send(res);
            },
            // mtimes only have one-second resolution on some filesystems
            Config::default().with_poll_interval(poll_interval).with_compare_contents(true),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let handle = tokio::spawn(dispatch_events(rx, watcher_impl, exts));
        debug!(dir = %dir.display(), ?poll_interval, "watching directory");
        Ok(DirectoryWatcher { dir, _watcher: watcher, handle })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop polling and abort the dispatch task. No more events are handled afterwards.
    pub fn shutdown(self) {
        self.handle.abort();
        debug!(dir = %self.dir.display(), "watcher stopped");
    }
}

async fn dispatch_events(
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    watched: Arc<dyn WatchedType>,
    exts: Vec<String>,
) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(?e, "Watcher error");
                continue;
            }
        };
        let removed = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => false,
            EventKind::Remove(_) => true,
            _ => continue,
        };
        for path in event.paths.iter().filter(|p| accepts(watched.as_ref(), p, &exts)) {
            let result = if removed {
                watched.on_remove(path).await
            } else {
                watched.on_create_or_modify(path).await
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %format!("{e:#}"), removed, "Failed to handle change");
            }
        }
    }
}

fn accepts(watched: &dyn WatchedType, path: &Path, exts: &[String]) -> bool {
    watched.is_relevant(path) || is_valid_extension(path, exts)
}

fn is_valid_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e == ext))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
