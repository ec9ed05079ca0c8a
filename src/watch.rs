//! Depth-bounded directory watching.
//!
//! [`DirWatcher`] wraps a `notify` watcher on one staging root and yields
//! file paths once their writes have settled: a path is handed on only after
//! its size has stayed the same for the configured settle window. Paths
//! nested more than `depth` directories below the root are ignored, as are
//! paths rejected by the caller's filter.
//!
//! [`scan_existing`] walks the same tree once, for startup catch-up.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::WatcherError;

const CHANNEL_CAPACITY: usize = 1024;
const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Maximum directory levels between the root and a file.
    pub depth: usize,
    /// How long a file's size must stay unchanged.
    pub settle: Duration,
}

/// Number of directories between `root` and `path`.
///
/// `root/a.txt` is depth 0, `root/x/y/a.txt` is depth 2. `None` when
/// `path` is not under `root`.
pub fn dir_depth(root: &Path, path: &Path) -> Option<usize> {
    let relative = path.strip_prefix(root).ok()?;
    Some(relative.components().count().saturating_sub(1))
}

/// `path` relative to `root`, also trying the canonical form of `root`
/// (watch backends may report canonicalized paths).
pub fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    if let Ok(rel) = path.strip_prefix(root) {
        return Some(rel.to_path_buf());
    }
    let canonical = std::fs::canonicalize(root).ok()?;
    path.strip_prefix(&canonical).ok().map(Path::to_path_buf)
}

/// A running watcher and the stream of settled paths it produces.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<PathBuf>,
}

impl DirWatcher {
    /// Start watching `root` recursively. Must be called inside a tokio runtime.
    pub fn start<F>(root: &Path, options: WatchOptions, filter: F) -> Result<Self, WatcherError>
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        let root = root.to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| WatcherError::Start {
            path: root.display().to_string(),
            source: notify::Error::io(e),
        })?;

        let (raw_tx, mut raw_rx) = mpsc::channel::<PathBuf>(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<PathBuf>(CHANNEL_CAPACITY);

        let event_root = root.clone();
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    for path in event.paths {
                        let within = dir_depth(&event_root, &path)
                            .or_else(|| dir_depth(&canonical_root, &path))
                            .is_some_and(|d| d <= options.depth);
                        if within && filter(&path) {
                            let _ = raw_tx.blocking_send(path);
                        }
                    }
                }
                Err(e) => {
                    let err = WatcherError::from(e);
                    tracing::warn!(error = %err, "filesystem watcher error");
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| WatcherError::Start {
            path: root.display().to_string(),
            source: e,
        })?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::Start {
                path: root.display().to_string(),
                source: e,
            })?;

        // Paths currently waiting to settle; repeat events for them are folded.
        let settling: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(async move {
            while let Some(path) = raw_rx.recv().await {
                if !settling.lock().unwrap().insert(path.clone()) {
                    continue;
                }
                let settling = settling.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let ready = wait_until_stable(&path, options.settle).await;
                    settling.lock().unwrap().remove(&path);
                    if ready {
                        let _ = out_tx.send(path).await;
                    }
                });
            }
        });

        tracing::info!(root = %root.display(), depth = options.depth, "watching");
        Ok(Self {
            _watcher: watcher,
            rx: out_rx,
        })
    }

    /// Next settled path, or `None` once the watcher is gone.
    pub async fn next(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

/// Wait until `path` is a file whose size has not changed for `settle`.
///
/// Returns `false` if the file disappears.
pub async fn wait_until_stable(path: &Path, settle: Duration) -> bool {
    let poll = (settle / 4).clamp(MIN_POLL, MAX_POLL);
    let mut last_size = None;
    let mut stable_for = Duration::ZERO;

    loop {
        let size = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m.len(),
            _ => return false,
        };
        if last_size == Some(size) {
            stable_for += poll;
        } else {
            last_size = Some(size);
            stable_for = Duration::ZERO;
        }
        if stable_for >= settle {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Files already under `root` within `depth`, accepted by `filter`, sorted.
pub async fn scan_existing<F>(root: &Path, depth: usize, filter: F) -> anyhow::Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> bool + Send + 'static,
{
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<PathBuf>> {
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(&root).max_depth(depth + 1) {
            let entry = entry?;
            if entry.file_type().is_file() && filter(entry.path()) {
                found.push(entry.into_path());
            }
        }
        // Sort for deterministic ordering
        found.sort();
        Ok(found)
    })
    .await?
}
