//! Capture boundary and session manager.
//!
//! The capture agent talks to this module through the HTTP server:
//! sessions are started and stopped, and every submitted screenshot (plus
//! optional page HTML) is written to the staging tree:
//!
//! ```text
//! capture_dir/{session}/{ts}.jpg | {ts}.html | {ts}.json        raw capture
//! cleaned_dir/{session}/{ts}/screenshot.jpg | cleaned.html | processed.json
//! ```
//!
//! Session state lives in a single actor task ([`SessionManager`]) and is
//! changed only through its command channel. A submission is acknowledged
//! as soon as it has been validated; writing, cleaning and chunking happen
//! afterwards in the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use capture_harness_core::chunk::chunk_html_with_limit;
use capture_harness_core::clean::clean_html_with_limit;
use capture_harness_core::models::{
    CaptureArtifact, CaptureContext, CaptureMetadata, OriginalPaths, SCHEMA_VERSION,
};

use crate::config::Config;
use crate::error::SessionError;
use crate::ingestor::{CLEANED_FILE, PROCESSED_FILE, SCREENSHOT_FILE};

const SESSION_PREFIX: &str = "session-";

/// Reply to `GetStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active_session: Option<String>,
    pub is_capturing: bool,
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    /// Resolve the session a capture belongs to, opening one if idle.
    Submit {
        reply: oneshot::Sender<Result<(String, bool), SessionError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Handle to the session actor. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Start the actor. Session numbers continue after those in `capture_dir`.
    pub fn spawn(capture_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        tokio::spawn(async move {
            let mut active: Option<String> = None;
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Start { reply } => {
                        let result = match &active {
                            Some(id) => Err(SessionError::AlreadyActive(id.clone())),
                            None => {
                                let id = open_session(&capture_dir).await;
                                tracing::info!(session = %id, "capture session started");
                                active = Some(id.clone());
                                Ok(id)
                            }
                        };
                        let _ = reply.send(result);
                    }
                    Command::Stop { reply } => {
                        let result = match active.take() {
                            Some(id) => {
                                tracing::info!(session = %id, "capture session stopped");
                                Ok(id)
                            }
                            None => Err(SessionError::NotActive),
                        };
                        let _ = reply.send(result);
                    }
                    Command::Submit { reply } => {
                        let resolved = match &active {
                            Some(id) => (id.clone(), false),
                            None => {
                                let id = open_session(&capture_dir).await;
                                tracing::warn!(session = %id, "capture without a session, opened one");
                                active = Some(id.clone());
                                (id, true)
                            }
                        };
                        let _ = reply.send(Ok(resolved));
                    }
                    Command::Status { reply } => {
                        let _ = reply.send(SessionStatus {
                            active_session: active.clone(),
                            is_capturing: active.is_some(),
                        });
                    }
                }
            }
        });
        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)
    }

    pub async fn start(&self) -> Result<String, SessionError> {
        self.call(|reply| Command::Start { reply }).await?
    }

    pub async fn stop(&self) -> Result<String, SessionError> {
        self.call(|reply| Command::Stop { reply }).await?
    }

    /// Session for a new capture and whether it was opened for it.
    pub async fn session_for_capture(&self) -> Result<(String, bool), SessionError> {
        self.call(|reply| Command::Submit { reply }).await?
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.call(|reply| Command::Status { reply }).await
    }
}

/// `session-N` with N one past the highest existing session directory.
pub async fn next_session_id(capture_dir: &Path) -> String {
    let mut max = 0u64;
    if let Ok(mut entries) = tokio::fs::read_dir(capture_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(n) = name
                .strip_prefix(SESSION_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            {
                max = max.max(n);
            }
        }
    }
    format!("{}{}", SESSION_PREFIX, max + 1)
}

async fn open_session(capture_dir: &Path) -> String {
    let id = next_session_id(capture_dir).await;
    if let Err(e) = tokio::fs::create_dir_all(capture_dir.join(&id)).await {
        tracing::warn!(session = %id, error = %e, "failed to create session directory");
    }
    id
}

/// Body of `POST /process`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    /// Base64 JPEG, optionally as a `data:` URL.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub area: Option<serde_json::Value>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Milliseconds since the epoch or any string; sanitized for paths.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

/// Immediate reply to a submitted capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAck {
    pub session_id: String,
    pub accepted: bool,
    pub image_path: String,
    pub timestamp: String,
    pub status: &'static str,
}

/// Make a client timestamp safe to use as a file and directory name.
pub fn sanitize_timestamp(raw: Option<&serde_json::Value>) -> String {
    let text = match raw {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        Utc::now().timestamp_millis().to_string()
    } else {
        cleaned
    }
}

fn decode_image(image: &str) -> Result<Vec<u8>, SessionError> {
    let data = match image.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    };
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| SessionError::InvalidCapture(format!("image is not base64: {}", e)))
}

/// Files written for one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCapture {
    pub raw_image: PathBuf,
    pub cleaned_dir: PathBuf,
    pub processed: Option<PathBuf>,
}

/// The capture boundary: validation, acknowledgement, background storage.
#[derive(Clone)]
pub struct CaptureService {
    sessions: SessionManager,
    capture_dir: PathBuf,
    cleaned_dir: PathBuf,
    max_html_bytes: usize,
}

impl CaptureService {
    pub fn new(config: &Config, sessions: SessionManager) -> Self {
        Self {
            sessions,
            capture_dir: config.paths.capture_dir.clone(),
            cleaned_dir: config.paths.cleaned_dir.clone(),
            max_html_bytes: config.cleaning.max_html_bytes,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    /// Validate a request and bind it to a session.
    pub async fn accept(&self, req: CaptureRequest) -> Result<(SubmitAck, CaptureArtifact), SessionError> {
        let image = req
            .image
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SessionError::InvalidCapture("image or area not provided".into()))?;
        let area = req
            .area
            .clone()
            .filter(|a| !a.is_null())
            .ok_or_else(|| SessionError::InvalidCapture("image or area not provided".into()))?;
        let image = decode_image(image)?;

        let (session_id, _opened) = self.sessions.session_for_capture().await?;
        let timestamp = sanitize_timestamp(req.timestamp.as_ref());

        let ack = SubmitAck {
            image_path: format!("/captured-images/{}/{}.jpg", session_id, timestamp),
            session_id: session_id.clone(),
            accepted: true,
            timestamp: timestamp.clone(),
            status: "processing",
        };
        let artifact = CaptureArtifact {
            schema_version: SCHEMA_VERSION,
            session_id,
            timestamp,
            image,
            html: req.html.filter(|h| !h.is_empty()),
            metadata: CaptureContext {
                url: req.url.unwrap_or_default(),
                title: req.title.unwrap_or_default(),
                area,
            },
        };
        Ok((ack, artifact))
    }

    /// Accept a capture and store it in the background.
    pub async fn submit(&self, req: CaptureRequest) -> Result<SubmitAck, SessionError> {
        let (ack, artifact) = self.accept(req).await?;
        let service = self.clone();
        tokio::spawn(async move {
            let name = format!("{}/{}", artifact.session_id, artifact.timestamp);
            match service.store(Arc::new(artifact)).await {
                Ok(stored) => tracing::info!(
                    capture = %name,
                    processed = stored.processed.is_some(),
                    "capture stored"
                ),
                Err(e) => tracing::error!(capture = %name, error = %e, "failed to store capture"),
            }
        });
        Ok(ack)
    }

    /// Write the raw files and the cleaned artifact.
    pub async fn store(&self, artifact: Arc<CaptureArtifact>) -> Result<StoredCapture> {
        let started = Utc::now();
        let session_dir = self.capture_dir.join(&artifact.session_id);
        let cleaned_dir = self
            .cleaned_dir
            .join(&artifact.session_id)
            .join(&artifact.timestamp);
        tokio::fs::create_dir_all(&session_dir)
            .await
            .with_context(|| format!("Failed to create {}", session_dir.display()))?;
        tokio::fs::create_dir_all(&cleaned_dir)
            .await
            .with_context(|| format!("Failed to create {}", cleaned_dir.display()))?;

        let raw_image = session_dir.join(format!("{}.jpg", artifact.timestamp));
        let raw_html = session_dir.join(format!("{}.html", artifact.timestamp));
        let raw_meta = session_dir.join(format!("{}.json", artifact.timestamp));

        tokio::fs::write(&raw_image, &artifact.image).await?;
        tokio::fs::write(cleaned_dir.join(SCREENSHOT_FILE), &artifact.image).await?;

        let mut processed = None;
        let mut has_cleaned = false;
        if let Some(html) = &artifact.html {
            tokio::fs::write(&raw_html, html).await?;

            let metadata = CaptureMetadata {
                url: artifact.metadata.url.clone(),
                title: artifact.metadata.title.clone(),
                timestamp: artifact.timestamp.clone(),
                capture_time: started.to_rfc3339(),
                original_path: Some(OriginalPaths {
                    image: raw_image.display().to_string(),
                    html: Some(raw_html.display().to_string()),
                    meta: raw_meta.display().to_string(),
                }),
            };
            let job = artifact.clone();
            let max = self.max_html_bytes;
            let result = tokio::task::spawn_blocking(move || {
                let html = job.html.as_deref().unwrap_or_default();
                let cleaned = clean_html_with_limit(html, max)?;
                let doc = chunk_html_with_limit(&cleaned, metadata, max)?;
                Ok::<_, capture_harness_core::ParseError>((cleaned, doc))
            })
            .await?;

            match result {
                Ok((cleaned, doc)) => {
                    tokio::fs::write(cleaned_dir.join(CLEANED_FILE), &cleaned).await?;
                    has_cleaned = true;
                    // Written under a temporary name so watchers never see a partial file
                    let target = cleaned_dir.join(PROCESSED_FILE);
                    let tmp = cleaned_dir.join(format!("{}.tmp", PROCESSED_FILE));
                    tokio::fs::write(&tmp, serde_json::to_string_pretty(&doc)?).await?;
                    tokio::fs::rename(&tmp, &target).await?;
                    processed = Some(target);
                }
                Err(e) => {
                    tracing::warn!(
                        session = %artifact.session_id,
                        timestamp = %artifact.timestamp,
                        error = %e,
                        "HTML not processed"
                    );
                }
            }
        }

        let meta = json!({
            "schemaVersion": SCHEMA_VERSION,
            "timestamp": artifact.timestamp,
            "url": artifact.metadata.url,
            "title": artifact.metadata.title,
            "area": artifact.metadata.area,
            "captureTime": (Utc::now() - started).num_milliseconds(),
            "cleanedDataPath": cleaned_dir.display().to_string(),
            "hasProcessedVersion": processed.is_some(),
            "hasCleanedVersion": has_cleaned,
            "hasScreenshot": true,
        });
        tokio::fs::write(&raw_meta, serde_json::to_string_pretty(&meta)?).await?;

        Ok(StoredCapture {
            raw_image,
            cleaned_dir,
            processed,
        })
    }
}

/// One entry of the session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub image_count: usize,
    pub html_count: usize,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub active: bool,
}

/// One capture of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEntry {
    pub timestamp: String,
    pub image_path: String,
    pub html_path: Option<String>,
}

fn is_image(name: &str) -> bool {
    name.ends_with(".jpg") || name.ends_with(".png")
}

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(s, _)| s)
}

/// Millisecond timestamps sort numerically; anything else after them, by text.
fn timestamp_order(ts: &str) -> (Option<i64>, String) {
    (ts.parse::<i64>().ok(), ts.to_string())
}

fn display_time(ts: &str) -> String {
    ts.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

async fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}

/// All `session-*` directories, newest session first.
pub async fn list_sessions(capture_dir: &Path, active: Option<&str>) -> Result<Vec<SessionSummary>> {
    if !capture_dir.exists() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    let mut entries = tokio::fs::read_dir(capture_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let id = entry.file_name().to_string_lossy().to_string();
        if !id.starts_with(SESSION_PREFIX) || !entry.file_type().await?.is_dir() {
            continue;
        }
        let names = file_names(&entry.path()).await?;
        let mut stamps: Vec<&str> = names.iter().filter(|n| is_image(n)).map(|n| stem(n)).collect();
        stamps.sort_by_key(|s| timestamp_order(s));

        sessions.push(SessionSummary {
            image_count: stamps.len(),
            html_count: names.iter().filter(|n| n.ends_with(".html")).count(),
            start_time: stamps.first().map(|s| display_time(s)),
            end_time: stamps.last().map(|s| display_time(s)),
            active: active == Some(id.as_str()),
            id,
        });
    }
    sessions.sort_by_key(|s| {
        std::cmp::Reverse(
            s.id.strip_prefix(SESSION_PREFIX)
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(0),
        )
    });
    Ok(sessions)
}

/// Captures of one session, newest first. `None` if the session is unknown.
pub async fn list_captures(capture_dir: &Path, session_id: &str) -> Result<Option<Vec<CaptureEntry>>> {
    if session_id.contains(['/', '\\']) || session_id.starts_with('.') {
        return Ok(None);
    }
    let dir = capture_dir.join(session_id);
    if !dir.is_dir() {
        return Ok(None);
    }
    let names = file_names(&dir).await?;
    let mut captures: Vec<CaptureEntry> = names
        .iter()
        .filter(|n| is_image(n))
        .map(|n| {
            let ts = stem(n).to_string();
            let html = format!("{}.html", ts);
            CaptureEntry {
                image_path: format!("/captured-images/{}/{}", session_id, n),
                html_path: names
                    .contains(&html)
                    .then(|| format!("/captured-images/{}/{}", session_id, html)),
                timestamp: ts,
            }
        })
        .collect();
    captures.sort_by_key(|c| std::cmp::Reverse(timestamp_order(&c.timestamp)));
    Ok(Some(captures))
}
