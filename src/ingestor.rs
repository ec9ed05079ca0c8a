//! Watch-queue ingestor: cleaned artifacts → analysis → prompt store.
//!
//! Observes `cleaned_dir/{session}/{timestamp}/processed.json` and, for
//! each artifact, produces `prompt_store/{session}_{timestamp}/` containing
//! the screenshot, the processed document and the analysis report.
//!
//! # Per-artifact lifecycle
//!
//! ```text
//! Unseen ──lock──▶ Locked ──▶ Processing ──▶ Done | Failed ──guard drop──▶ Unlocked
//! ```
//!
//! The lock is a [`LockGuard`](crate::lock::LockGuard) held for the whole
//! run, so it is released on success, error, and panic alike. A second
//! signal for an artifact that is still locked is dropped silently; a
//! signal for an artifact that already has its `{timestamp}_prompt.txt`
//! report is skipped.
//!
//! Without an analyzer (no API key) the ingestor runs copy-only: files are
//! copied into the prompt store but no report or event is produced.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use capture_harness_core::models::{EventPayload, SCHEMA_VERSION};

use crate::analysis::Analyzer;
use crate::config::Config;
use crate::events::EventPublisher;
use crate::lock::LockDir;
use crate::queue::WorkQueue;
use crate::watch::{self, DirWatcher, WatchOptions};

pub const PROCESSED_FILE: &str = "processed.json";
pub const SCREENSHOT_FILE: &str = "screenshot.jpg";
pub const CLEANED_FILE: &str = "cleaned.html";
pub const ANALYSIS_FILE: &str = "analysis.txt";

const QUEUE_CAPACITY: usize = 256;

/// What [`Ingestor::handle`] did with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Files copied; `analyzed` is true when a report was written.
    Processed { analyzed: bool },
    /// Another run holds the lock.
    Locked,
    /// A report already exists.
    AlreadyReported,
    /// Not an artifact path.
    Ignored,
}

/// `{session}/{timestamp}` of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub session: String,
    pub timestamp: String,
}

impl ArtifactKey {
    /// Parse `{cleaned_dir}/{session}/{timestamp}/processed.json`.
    pub fn from_path(cleaned_dir: &Path, path: &Path) -> Option<Self> {
        let rel = watch::relative_to(cleaned_dir, path)?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        match parts.as_slice() {
            [session, timestamp, file] if file == PROCESSED_FILE => Some(Self {
                session: session.clone(),
                timestamp: timestamp.clone(),
            }),
            _ => None,
        }
    }

    /// Lock key and prompt-store folder name.
    pub fn name(&self) -> String {
        format!("{}_{}", self.session, self.timestamp)
    }

    pub fn report_name(&self) -> String {
        format!("{}_prompt.txt", self.timestamp)
    }
}

pub struct Ingestor {
    cleaned_dir: PathBuf,
    prompt_store: PathBuf,
    locks: LockDir,
    analyzer: Option<Arc<dyn Analyzer>>,
    publisher: Option<Arc<EventPublisher>>,
    options: WatchOptions,
}

impl Ingestor {
    pub fn new(
        config: &Config,
        analyzer: Option<Arc<dyn Analyzer>>,
        publisher: Option<Arc<EventPublisher>>,
    ) -> Self {
        Self {
            cleaned_dir: config.paths.cleaned_dir.clone(),
            prompt_store: config.paths.prompt_store.clone(),
            locks: LockDir::new(config.paths.lock_dir()),
            analyzer,
            publisher,
            options: WatchOptions {
                depth: config.ingest.watch_depth,
                settle: Duration::from_millis(config.ingest.settle_ms),
            },
        }
    }

    pub fn locks(&self) -> &LockDir {
        &self.locks
    }

    /// Process one `processed.json`. Safe to call concurrently for the same path.
    pub async fn handle(&self, path: &Path) -> Result<Outcome> {
        let Some(key) = ArtifactKey::from_path(&self.cleaned_dir, path) else {
            return Ok(Outcome::Ignored);
        };
        let name = key.name();

        let Some(_guard) = self.locks.try_acquire(&name).await? else {
            tracing::debug!(artifact = %name, "already being processed");
            return Ok(Outcome::Locked);
        };

        let artifact_dir = path.parent().unwrap_or(&self.cleaned_dir);
        let report_path = artifact_dir.join(key.report_name());
        if tokio::fs::try_exists(&report_path).await.unwrap_or(false) {
            tracing::debug!(artifact = %name, "already reported");
            return Ok(Outcome::AlreadyReported);
        }

        tracing::info!(artifact = %name, "processing");
        let out_dir = self.prompt_store.join(&name);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;

        let screenshot = artifact_dir.join(SCREENSHOT_FILE);
        let has_screenshot = tokio::fs::try_exists(&screenshot).await.unwrap_or(false);
        if has_screenshot {
            tokio::fs::copy(&screenshot, out_dir.join(SCREENSHOT_FILE))
                .await
                .with_context(|| format!("Failed to copy {}", screenshot.display()))?;
        } else {
            tracing::warn!(artifact = %name, "no screenshot");
        }

        let processed_text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        tokio::fs::write(out_dir.join(PROCESSED_FILE), &processed_text).await?;
        let processed: serde_json::Value = serde_json::from_str(&processed_text)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;

        let Some(analyzer) = &self.analyzer else {
            tracing::info!(artifact = %name, "copied (analysis disabled)");
            return Ok(Outcome::Processed { analyzed: false });
        };

        let payload = combined_payload(&key, &processed, has_screenshot)?;
        let Some(report) = analyzer.analyze(&payload).await else {
            tracing::warn!(artifact = %name, "no analysis produced");
            return Ok(Outcome::Processed { analyzed: false });
        };

        tokio::fs::write(out_dir.join(ANALYSIS_FILE), &report.text).await?;
        tokio::fs::write(&report_path, &report.text).await?;
        tracing::info!(
            artifact = %name,
            segments = report.segments_total,
            succeeded = report.segments_succeeded,
            summarized = report.summarized,
            "analysis written"
        );

        if let Some(publisher) = &self.publisher {
            let event = EventPayload {
                schema_version: SCHEMA_VERSION,
                prompt_text: report.text,
                image_url: has_screenshot
                    .then(|| format!("/api/files/{}/{}", name, SCREENSHOT_FILE)),
                processed_data: Some(processed),
            };
            // The artifact is done either way
            if let Err(e) = publisher.publish(event).await {
                tracing::error!(artifact = %name, error = %e, "event publish failed");
            }
        }

        Ok(Outcome::Processed { analyzed: true })
    }

    async fn handle_logged(&self, path: &Path) {
        if let Err(e) = self.handle(path).await {
            tracing::error!(path = %path.display(), error = %e, "ingestion failed");
        }
    }

    /// Sweep stale locks, catch up on existing artifacts, then follow new ones.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let removed = self.locks.sweep().await?;
        if removed > 0 {
            tracing::info!(removed, "cleared stale locks");
        }

        let is_processed = |p: &Path| p.file_name().is_some_and(|n| n == PROCESSED_FILE);
        let mut watcher = DirWatcher::start(&self.cleaned_dir, self.options, is_processed)?;

        let worker = self.clone();
        let queue = WorkQueue::spawn("ingestor", QUEUE_CAPACITY, move |path: PathBuf| {
            let ingestor = worker.clone();
            async move { ingestor.handle_logged(&path).await }
        });

        let existing =
            watch::scan_existing(&self.cleaned_dir, self.options.depth, is_processed).await?;
        if !existing.is_empty() {
            tracing::info!(artifacts = existing.len(), "queued existing artifacts");
        }
        for path in existing {
            queue.push(path).await?;
        }

        while let Some(path) = watcher.next().await {
            queue.push(path).await?;
        }
        queue.finish().await;
        Ok(())
    }
}

/// The text handed to the analyzer.
pub fn combined_payload(
    key: &ArtifactKey,
    processed: &serde_json::Value,
    has_screenshot: bool,
) -> Result<String> {
    let value = json!({
        "schemaVersion": SCHEMA_VERSION,
        "artifact": { "session": key.session, "timestamp": key.timestamp },
        "hasScreenshot": has_screenshot,
        "metadata": processed.get("metadata").cloned().unwrap_or_default(),
        "structure": processed.get("structure").cloned().unwrap_or_default(),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisReport;
    use async_trait::async_trait;
    use capture_harness_core::models::DeliveryMethod;
    use capture_harness_core::store::memory::InMemoryEventStore;
    use capture_harness_core::store::EventStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct SlowAnalyzer {
        calls: AtomicUsize,
        delay: Duration,
        result: Option<&'static str>,
    }

    #[async_trait]
    impl Analyzer for SlowAnalyzer {
        async fn analyze(&self, payload: &str) -> Option<AnalysisReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(payload.contains("https://example.com"));
            tokio::time::sleep(self.delay).await;
            self.result.map(|text| AnalysisReport {
                text: text.to_string(),
                summarized: false,
                segments_total: 1,
                segments_succeeded: 1,
            })
        }
    }

    fn analyzer(result: Option<&'static str>) -> Arc<SlowAnalyzer> {
        Arc::new(SlowAnalyzer {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            result,
        })
    }

    fn stage_artifact(cfg: &Config, session: &str, ts: &str) -> PathBuf {
        let dir = cfg.paths.cleaned_dir.join(session).join(ts);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SCREENSHOT_FILE), b"jpeg").unwrap();
        let processed = dir.join(PROCESSED_FILE);
        std::fs::write(
            &processed,
            r#"{"metadata":{"url":"https://example.com","title":"Example"},"structure":[]}"#,
        )
        .unwrap();
        processed
    }

    #[test]
    fn test_artifact_key() {
        let root = Path::new("/data/cleaned");
        let key = ArtifactKey::from_path(root, Path::new("/data/cleaned/session-1/t1/processed.json")).unwrap();
        assert_eq!(key.name(), "session-1_t1");
        assert_eq!(key.report_name(), "t1_prompt.txt");
        assert!(ArtifactKey::from_path(root, Path::new("/data/cleaned/session-1/t1/other.json")).is_none());
        assert!(ArtifactKey::from_path(root, Path::new("/data/cleaned/t1/processed.json")).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_signals_yield_one_run() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let path = stage_artifact(&cfg, "session-1", "t1");
        let fake = analyzer(Some("report"));
        let ingestor = Ingestor::new(&cfg, Some(fake.clone()), None);

        let (a, b) = tokio::join!(ingestor.handle(&path), ingestor.handle(&path));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, Outcome::Locked));
        assert_eq!(outcomes, vec![Outcome::Processed { analyzed: true }, Outcome::Locked]);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        // Lock released; a later signal sees the report and skips
        assert!(!ingestor.locks().marker_path("session-1_t1").exists());
        assert_eq!(ingestor.handle(&path).await.unwrap(), Outcome::AlreadyReported);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outputs_and_event() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let path = stage_artifact(&cfg, "session-2", "t9");
        let store = Arc::new(InMemoryEventStore::new());
        let publisher = Arc::new(EventPublisher::new(crate::events::Transport::Direct, store.clone()));
        let ingestor = Ingestor::new(&cfg, Some(analyzer(Some("the analysis"))), Some(publisher));

        assert_eq!(
            ingestor.handle(&path).await.unwrap(),
            Outcome::Processed { analyzed: true }
        );

        let out = cfg.paths.prompt_store.join("session-2_t9");
        assert_eq!(std::fs::read(out.join(SCREENSHOT_FILE)).unwrap(), b"jpeg");
        assert!(out.join(PROCESSED_FILE).exists());
        assert_eq!(std::fs::read_to_string(out.join(ANALYSIS_FILE)).unwrap(), "the analysis");
        assert_eq!(
            std::fs::read_to_string(path.parent().unwrap().join("t9_prompt.txt")).unwrap(),
            "the analysis"
        );

        let events = store.events_after(DeliveryMethod::Direct, None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.prompt_text, "the analysis");
        assert_eq!(
            events[0].payload.image_url.as_deref(),
            Some("/api/files/session-2_t9/screenshot.jpg")
        );
    }

    #[tokio::test]
    async fn test_copy_only_and_failed_analysis_release_lock() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let path = stage_artifact(&cfg, "session-3", "t1");

        let copy_only = Ingestor::new(&cfg, None, None);
        assert_eq!(
            copy_only.handle(&path).await.unwrap(),
            Outcome::Processed { analyzed: false }
        );
        let out = cfg.paths.prompt_store.join("session-3_t1");
        assert!(out.join(PROCESSED_FILE).exists());
        assert!(!out.join(ANALYSIS_FILE).exists());

        let failing = Ingestor::new(&cfg, Some(analyzer(None)), None);
        assert_eq!(
            failing.handle(&path).await.unwrap(),
            Outcome::Processed { analyzed: false }
        );
        assert!(!failing.locks().is_locked("session-3_t1"));
        assert!(!path.parent().unwrap().join("t1_prompt.txt").exists());
    }

    #[tokio::test]
    async fn test_invalid_json_is_error_and_unlocks() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let path = stage_artifact(&cfg, "session-4", "t1");
        std::fs::write(&path, "{broken").unwrap();

        let ingestor = Ingestor::new(&cfg, Some(analyzer(Some("x"))), None);
        assert!(ingestor.handle(&path).await.is_err());
        assert!(!ingestor.locks().marker_path("session-4_t1").exists());
        assert!(!ingestor.locks().is_locked("session-4_t1"));
    }

    #[tokio::test]
    async fn test_run_sweeps_and_catches_up() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::rooted_at(tmp.path());
        cfg.ingest.settle_ms = 50;
        let path = stage_artifact(&cfg, "session-5", "t1");

        // Orphan from a crashed run would otherwise block the artifact
        std::fs::create_dir_all(cfg.paths.lock_dir()).unwrap();
        std::fs::write(cfg.paths.lock_dir().join("session-5_t1.lock"), "stale").unwrap();

        let fake = analyzer(Some("caught up"));
        let ingestor = Arc::new(Ingestor::new(&cfg, Some(fake.clone()), None));
        let task = tokio::spawn(ingestor.clone().run());

        let report = path.parent().unwrap().join("t1_prompt.txt");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !report.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert!(report.exists());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }
}
