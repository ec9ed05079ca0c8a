//! Advisory processing locks.
//!
//! A lock is two things held together: an entry in an in-memory dedup set
//! (fast path for duplicate watcher events inside one process) and a marker
//! file `{dir}/{key}.lock` that survives a crash. Both are released by
//! dropping the [`LockGuard`], so every exit path (success, error, panic
//! unwind) cleans up. Markers orphaned by a crash are removed by
//! [`LockDir::sweep`] at startup, before any watcher runs.
//!
//! These locks do not coordinate multiple processes sharing one staging
//! tree.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

const LOCK_EXT: &str = "lock";

/// Directory of lock markers plus the process-local dedup set.
#[derive(Clone)]
pub struct LockDir {
    dir: PathBuf,
    active: Arc<Mutex<HashSet<String>>>,
}

impl LockDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, LOCK_EXT))
    }

    /// True if `key` is held in this process or has a marker on disk.
    pub fn is_locked(&self, key: &str) -> bool {
        self.active.lock().unwrap().contains(key) || self.marker_path(key).exists()
    }

    /// Remove every marker in the lock directory. Returns how many were removed.
    pub async fn sweep(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create lock dir {}", self.dir.display()))?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXT) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed stale lock");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(removed)
    }

    /// Take the lock for `key`.
    ///
    /// Returns `Ok(None)` when the key is already being processed, either in
    /// this process or by a marker left on disk.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>> {
        if !self.active.lock().unwrap().insert(key.to_string()) {
            return Ok(None);
        }

        // From here on the guard owns the dedup entry; dropping it early
        // releases the entry without touching a marker we did not create.
        let mut guard = LockGuard {
            key: key.to_string(),
            marker: None,
            active: self.active.clone(),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.marker_path(key);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()))
            }
        };
        guard.marker = Some(path);

        file.write_all(chrono::Utc::now().to_rfc3339().as_bytes())
            .await?;
        file.flush().await?;

        Ok(Some(guard))
    }
}

/// Held while a key is being processed. Dropping it releases the lock.
pub struct LockGuard {
    key: String,
    marker: Option<PathBuf>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.marker {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove lock marker");
                }
            }
        }
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let tmp = TempDir::new().unwrap();
        let locks = LockDir::new(tmp.path().join(".processing"));

        let guard = locks.try_acquire("session-1_t1").await.unwrap().unwrap();
        assert!(locks.marker_path("session-1_t1").exists());
        assert!(locks.is_locked("session-1_t1"));
        assert!(locks.try_acquire("session-1_t1").await.unwrap().is_none());

        drop(guard);
        assert!(!locks.marker_path("session-1_t1").exists());
        assert!(!locks.is_locked("session-1_t1"));
        assert!(locks.try_acquire("session-1_t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_released_on_error_path() {
        let tmp = TempDir::new().unwrap();
        let locks = LockDir::new(tmp.path());

        async fn failing_work(locks: &LockDir) -> Result<()> {
            let _guard = locks.try_acquire("k").await?.unwrap();
            anyhow::bail!("downstream failed")
        }
        assert!(failing_work(&locks).await.is_err());
        assert!(!locks.marker_path("k").exists());
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn test_released_on_panic() {
        let tmp = TempDir::new().unwrap();
        let locks = LockDir::new(tmp.path());

        let task_locks = locks.clone();
        let result = tokio::spawn(async move {
            let _guard = task_locks.try_acquire("k").await.unwrap().unwrap();
            panic!("worker crashed");
        })
        .await;
        assert!(result.is_err());
        assert!(!locks.marker_path("k").exists());
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn test_orphan_marker_blocks_until_swept() {
        let tmp = TempDir::new().unwrap();
        let locks = LockDir::new(tmp.path());
        std::fs::write(locks.marker_path("crashed"), "2024-01-01T00:00:00Z").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "keep").unwrap();

        assert!(locks.try_acquire("crashed").await.unwrap().is_none());
        // The refused acquire must not leave a dedup entry behind.
        assert!(!locks.active.lock().unwrap().contains("crashed"));

        assert_eq!(locks.sweep().await.unwrap(), 1);
        assert!(tmp.path().join("notes.txt").exists());
        assert!(locks.try_acquire("crashed").await.unwrap().is_some());
    }
}
