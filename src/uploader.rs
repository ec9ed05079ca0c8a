//! Durable uploader: prompt store → blob store + project aggregates.
//!
//! Every file under the prompt store is streamed into the [`BlobStore`] and,
//! only after the store has committed, moved into the mirrored `done/` tree.
//! A crash or a failed commit therefore leaves the source where it was, and
//! the next run picks it up again.
//!
//! # Project linkage
//!
//! Files are grouped by their top-level folder (files directly under the
//! root belong to `default`). Each group resolves or creates one
//! [`ProjectAggregate`]:
//!
//! | File | Effect on the aggregate |
//! |------|-------------------------|
//! | `*.json` | parsed into `structured_data` (parse failure is logged) |
//! | `*.txt` | content becomes `prompt` |
//! | first image | `image_url = /api/files/{project}/{filename}` |
//! | any | upsert an [`UploadRecord`] keyed by `(filename, relative_path)` |
//!
//! The aggregate is saved once per group.
//!
//! # Modes
//!
//! - **Batch** ([`Uploader::run_batch`]): scan once, one group per project.
//! - **Watch** ([`Uploader::watch`]): startup scan, then one job per settled
//!   file, all through a single-worker [`WorkQueue`].

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};

use capture_harness_core::models::{FileType, ProjectAggregate, UploadRecord};
use capture_harness_core::store::ProjectStore;

use crate::blob_store::{BlobMetadata, BlobStore};
use crate::config::Config;
use crate::error::StorageError;
use crate::queue::WorkQueue;
use crate::watch::{self, DirWatcher, WatchOptions};

/// Project name for files directly under the prompt store root.
pub const DEFAULT_PROJECT: &str = "default";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type and file category for `path`.
pub fn classify(path: &Path) -> (String, FileType) {
    let content_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string();
    let file_type = path
        .extension()
        .and_then(|e| e.to_str())
        .map(FileType::from_extension)
        .unwrap_or(FileType::Other);
    (content_type, file_type)
}

/// Top-level folder of a path relative to the prompt store.
pub fn project_name_for(relative: &Path) -> String {
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(first), Some(_)) => first.as_os_str().to_string_lossy().to_string(),
        _ => DEFAULT_PROJECT.to_string(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Content pulled from a file for project linkage, read before the move.
enum LinkContent {
    None,
    Json(serde_json::Value),
    Prompt(String),
}

/// A committed and relocated upload.
pub struct Uploaded {
    pub record: UploadRecord,
    link: LinkContent,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchStats {
    fn merge(&mut self, other: BatchStats) {
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct Uploader {
    root: PathBuf,
    done_dir: PathBuf,
    blobs: Arc<dyn BlobStore>,
    projects: Option<Arc<dyn ProjectStore>>,
    default_user: String,
    excludes: Arc<GlobSet>,
    watch_depth: usize,
    settle: Duration,
    queue_capacity: usize,
}

impl Uploader {
    /// `projects` is `None` when project linkage is disabled.
    pub fn new(
        config: &Config,
        blobs: Arc<dyn BlobStore>,
        projects: Option<Arc<dyn ProjectStore>>,
    ) -> Result<Self> {
        let projects = if config.upload.link_projects {
            projects
        } else {
            None
        };
        Ok(Self {
            root: config.paths.prompt_store.clone(),
            done_dir: config.paths.done_dir(),
            blobs,
            projects,
            default_user: config.upload.default_user.clone(),
            excludes: Arc::new(build_globset(&config.upload.exclude_globs)?),
            watch_depth: config.upload.watch_depth,
            settle: Duration::from_millis(config.upload.settle_ms),
            queue_capacity: config.upload.queue_capacity,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidate_filter(&self) -> impl Fn(&Path) -> bool + Send + Sync + 'static {
        let root = self.root.clone();
        let excludes = self.excludes.clone();
        move |path: &Path| match watch::relative_to(&root, path) {
            Some(rel) => !excludes.is_match(&rel),
            None => false,
        }
    }

    /// Pending files grouped by project name, each group sorted.
    pub async fn scan(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        let files = watch::scan_existing(&self.root, self.watch_depth, self.candidate_filter()).await?;
        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in files {
            if let Some(rel) = watch::relative_to(&self.root, &path) {
                groups.entry(project_name_for(&rel)).or_default().push(path);
            }
        }
        Ok(groups)
    }

    /// Store one file, then move it into `done/`.
    ///
    /// Returns `Ok(None)` when the file vanished before it could be read.
    pub async fn upload_file(&self, path: &Path) -> Result<Option<Uploaded>, StorageError> {
        let stat = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let relative = watch::relative_to(&self.root, path)
            .unwrap_or_else(|| PathBuf::from(path.file_name().unwrap_or_default()));
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (content_type, file_type) = classify(path);
        let project_name = project_name_for(&relative);
        let relative_str = relative.to_string_lossy().to_string();

        let link = self.read_link_content(path, &filename, file_type).await;

        let metadata = BlobMetadata {
            filename: filename.clone(),
            content_type: content_type.clone(),
            file_size: stat.len() as i64,
            file_type,
            parent_directory: relative
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            upload_date: Utc::now(),
            original_path: path.display().to_string(),
            project_name: Some(project_name),
            relative_path: Some(relative_str.clone()),
        };

        let file_id = self.blobs.put(&metadata, path).await?;
        tracing::info!(file = %relative_str, id = %file_id, "stored");

        // Committed; now the source may move.
        if let Err(e) = self.relocate(path, &relative).await {
            tracing::warn!(file = %relative_str, error = %e, "stored but not moved to done");
        }

        Ok(Some(Uploaded {
            record: UploadRecord {
                file_id,
                filename,
                file_type,
                relative_path: relative_str,
                content_type,
                size: stat.len() as i64,
                upload_date: metadata.upload_date,
            },
            link,
        }))
    }

    async fn read_link_content(&self, path: &Path, filename: &str, file_type: FileType) -> LinkContent {
        if self.projects.is_none() {
            return LinkContent::None;
        }
        let is_txt = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("txt"));
        if file_type != FileType::Json && !is_txt {
            return LinkContent::None;
        }
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(file = %filename, error = %e, "could not read for project linkage");
                return LinkContent::None;
            }
        };
        if file_type == FileType::Json {
            match serde_json::from_str(&text) {
                Ok(value) => LinkContent::Json(value),
                Err(e) => {
                    tracing::warn!(file = %filename, error = %e, "could not parse JSON");
                    LinkContent::None
                }
            }
        } else {
            LinkContent::Prompt(text)
        }
    }

    async fn relocate(&self, source: &Path, relative: &Path) -> Result<(), StorageError> {
        let target = self.done_dir.join(relative);
        if let Some(parent) = target.parent() {
            // Concurrent creators of the same directory are fine
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                if e.kind() != ErrorKind::AlreadyExists {
                    return Err(StorageError::io(parent, e));
                }
            }
        }
        tokio::fs::rename(source, &target)
            .await
            .map_err(|e| StorageError::io(source, e))
    }

    /// Upload every file of one project and save the aggregate once.
    pub async fn process_project(&self, project_name: &str, files: &[PathBuf]) -> BatchStats {
        let mut stats = BatchStats::default();
        let mut project = match self.resolve_project(project_name).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(project = %project_name, error = %e, "project lookup failed");
                None
            }
        };

        for path in files {
            match self.upload_file(path).await {
                Ok(Some(uploaded)) => {
                    stats.uploaded += 1;
                    if let Some(project) = project.as_mut() {
                        apply_upload(project, uploaded);
                    }
                }
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    // Left in place for the next run
                    stats.failed += 1;
                    tracing::error!(file = %path.display(), error = %e, "upload failed");
                }
            }
        }

        if let (Some(store), Some(project)) = (&self.projects, project.as_mut()) {
            if stats.uploaded > 0 {
                project.updated_at = Utc::now();
                match store.save_project(project).await {
                    Ok(()) => tracing::info!(
                        project = %project_name,
                        files = project.files.len(),
                        "saved project"
                    ),
                    Err(e) => {
                        tracing::error!(project = %project_name, error = %e, "project save failed")
                    }
                }
            }
        }
        stats
    }

    async fn resolve_project(&self, project_name: &str) -> Result<Option<ProjectAggregate>> {
        let Some(store) = &self.projects else {
            return Ok(None);
        };
        match store.find_project(project_name).await? {
            Some(p) => Ok(Some(p)),
            None => {
                tracing::info!(project = %project_name, "creating project");
                Ok(Some(ProjectAggregate::new(project_name, &self.default_user)))
            }
        }
    }

    /// Scan once and upload everything pending.
    pub async fn run_batch(&self) -> Result<BatchStats> {
        let groups = self.scan().await?;
        let mut total = BatchStats::default();
        for (project_name, files) in &groups {
            total.merge(self.process_project(project_name, files).await);
        }
        Ok(total)
    }

    /// Upload pending files, then keep uploading new ones as they settle.
    pub async fn watch(self: Arc<Self>) -> Result<()> {
        let worker = self.clone();
        let queue = WorkQueue::spawn("uploader", self.queue_capacity, move |path: PathBuf| {
            let uploader = worker.clone();
            async move {
                let Some(rel) = watch::relative_to(uploader.root(), &path) else {
                    return;
                };
                let project = project_name_for(&rel);
                uploader.process_project(&project, &[path]).await;
            }
        });

        let mut watcher = DirWatcher::start(
            &self.root,
            WatchOptions {
                depth: self.watch_depth,
                settle: self.settle,
            },
            self.candidate_filter(),
        )?;

        let pending = watch::scan_existing(&self.root, self.watch_depth, self.candidate_filter()).await?;
        if !pending.is_empty() {
            tracing::info!(files = pending.len(), "uploading files found at startup");
        }
        for path in pending {
            queue.push(path).await?;
        }

        while let Some(path) = watcher.next().await {
            queue.push(path).await?;
        }
        queue.finish().await;
        Ok(())
    }
}

fn apply_upload(project: &mut ProjectAggregate, uploaded: Uploaded) {
    match uploaded.link {
        LinkContent::Json(value) => project.structured_data = Some(value),
        LinkContent::Prompt(text) => project.prompt = Some(text),
        LinkContent::None => {}
    }
    if uploaded.record.file_type == FileType::Image && project.image_url.is_none() {
        project.image_url = Some(format!(
            "/api/files/{}/{}",
            project.project_name, uploaded.record.filename
        ));
    }
    project.upsert_file(uploaded.record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{SqliteBlobStore, StoredBlob};
    use async_trait::async_trait;
    use capture_harness_core::store::memory::InMemoryProjectStore;
    use tempfile::TempDir;

    struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn put(&self, _: &BlobMetadata, _: &Path) -> Result<String, StorageError> {
            Err(StorageError::Database(sqlx::Error::PoolClosed))
        }

        async fn get(&self, _: &str) -> Result<Option<(StoredBlob, Vec<u8>)>, StorageError> {
            Ok(None)
        }

        async fn find_latest(&self, _: &str, _: &str) -> Result<Option<StoredBlob>, StorageError> {
            Ok(None)
        }
    }

    /// Fails only for files whose name contains "bad".
    struct SelectiveBlobStore(SqliteBlobStore);

    #[async_trait]
    impl BlobStore for SelectiveBlobStore {
        async fn put(&self, meta: &BlobMetadata, source: &Path) -> Result<String, StorageError> {
            if meta.filename.contains("bad") {
                return Err(StorageError::Database(sqlx::Error::PoolClosed));
            }
            self.0.put(meta, source).await
        }

        async fn get(&self, id: &str) -> Result<Option<(StoredBlob, Vec<u8>)>, StorageError> {
            self.0.get(id).await
        }

        async fn find_latest(&self, p: &str, f: &str) -> Result<Option<StoredBlob>, StorageError> {
            self.0.find_latest(p, f).await
        }
    }

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn sqlite_blobs(cfg: &Config) -> SqliteBlobStore {
        SqliteBlobStore::new(crate::db::connect_migrated(cfg).await.unwrap())
    }

    #[test]
    fn test_classify_and_project_name() {
        assert_eq!(classify(Path::new("a/screenshot.JPG")), ("image/jpeg".to_string(), FileType::Image));
        assert_eq!(classify(Path::new("a/processed.json")).1, FileType::Json);
        assert_eq!(classify(Path::new("a/analysis.txt")), ("text/plain".to_string(), FileType::Text));
        assert_eq!(
            classify(Path::new("a/blob.zzunknown")),
            (FALLBACK_CONTENT_TYPE.to_string(), FileType::Other)
        );

        assert_eq!(project_name_for(Path::new("s1_t1/analysis.txt")), "s1_t1");
        assert_eq!(project_name_for(Path::new("s1_t1/nested/x.png")), "s1_t1");
        assert_eq!(project_name_for(Path::new("loose.txt")), DEFAULT_PROJECT);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_source_in_place() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let source = write(&cfg.paths.prompt_store, "s1_t1/analysis.txt", "report");
        let projects = Arc::new(InMemoryProjectStore::new());

        let uploader = Uploader::new(&cfg, Arc::new(FailingBlobStore), Some(projects.clone())).unwrap();
        let stats = uploader.run_batch().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.uploaded, 0);
        assert!(source.exists());
        assert!(!cfg.paths.done_dir().join("s1_t1/analysis.txt").exists());
        assert_eq!(projects.save_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_links_project_and_moves_files() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let store = &cfg.paths.prompt_store;
        write(store, "s1_t1/analysis.txt", "the report");
        write(store, "s1_t1/processed.json", r#"{"metadata":{"url":"https://a.io"}}"#);
        write(store, "s1_t1/screenshot.jpg", "jpegbytes");
        write(store, "loose.txt", "loose");
        write(store, "done/old/ignored.txt", "already done");
        write(store, ".processing/s1_t1.lock", "2024-01-01T00:00:00Z");

        let blobs = Arc::new(sqlite_blobs(&cfg).await);
        let projects = Arc::new(InMemoryProjectStore::new());
        let uploader = Uploader::new(&cfg, blobs.clone(), Some(projects.clone())).unwrap();

        let stats = uploader.run_batch().await.unwrap();
        assert_eq!(stats.uploaded, 4);
        assert_eq!(stats.failed, 0);
        // One save per project group
        assert_eq!(projects.save_count(), 2);

        let project = projects.find_project("s1_t1").await.unwrap().unwrap();
        assert_eq!(project.user_id, "system");
        assert_eq!(project.status, "imported");
        assert_eq!(project.files.len(), 3);
        assert_eq!(project.prompt.as_deref(), Some("the report"));
        assert_eq!(
            project.structured_data,
            Some(serde_json::json!({"metadata": {"url": "https://a.io"}}))
        );
        assert_eq!(project.image_url.as_deref(), Some("/api/files/s1_t1/screenshot.jpg"));
        assert!(projects.find_project(DEFAULT_PROJECT).await.unwrap().is_some());

        let done = cfg.paths.done_dir();
        assert!(done.join("s1_t1/analysis.txt").exists());
        assert!(done.join("loose.txt").exists());
        assert!(!store.join("s1_t1/analysis.txt").exists());
        assert!(store.join("done/old/ignored.txt").exists());
        assert!(store.join(".processing/s1_t1.lock").exists());

        let blob = blobs.find_latest("s1_t1", "screenshot.jpg").await.unwrap().unwrap();
        let (_, data) = blobs.get(&blob.id).await.unwrap().unwrap();
        assert_eq!(data, b"jpegbytes");

        // A second run finds nothing to do
        assert_eq!(uploader.run_batch().await.unwrap(), BatchStats::default());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_file() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let store = &cfg.paths.prompt_store;
        write(store, "p/good.txt", "ok");
        let bad = write(store, "p/bad.txt", "nope");
        write(store, "p/broken.json", "{not json");

        let blobs = Arc::new(SelectiveBlobStore(sqlite_blobs(&cfg).await));
        let projects = Arc::new(InMemoryProjectStore::new());
        let uploader = Uploader::new(&cfg, blobs, Some(projects.clone())).unwrap();

        let stats = uploader.run_batch().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.uploaded, 2);
        assert!(bad.exists());

        let project = projects.find_project("p").await.unwrap().unwrap();
        assert_eq!(project.files.len(), 2);
        assert!(project.structured_data.is_none());
        assert_eq!(project.prompt.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_reupload_replaces_file_record() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::rooted_at(tmp.path());
        let store = &cfg.paths.prompt_store;
        let projects = Arc::new(InMemoryProjectStore::new());
        let uploader = Uploader::new(
            &cfg,
            Arc::new(sqlite_blobs(&cfg).await),
            Some(projects.clone()),
        )
        .unwrap();

        write(store, "p/analysis.txt", "first");
        uploader.run_batch().await.unwrap();
        write(store, "p/analysis.txt", "second");
        uploader.run_batch().await.unwrap();

        let project = projects.find_project("p").await.unwrap().unwrap();
        assert_eq!(project.files.len(), 1);
        assert_eq!(project.prompt.as_deref(), Some("second"));
    }
}
