//! Inter-stage data types for the capture pipeline.
//!
//! Every record that crosses a stage boundary (a file on disk, a row in the
//! document store, a broker message) has an explicit serde type here. Wire
//! field names are camelCase so that staged artifacts remain readable by the
//! capture agent and the web application.
//!
//! | Type | Produced by | Consumed by |
//! |------|-------------|-------------|
//! | [`CaptureArtifact`] | capture boundary | cleaning stage |
//! | [`ChunkedDocument`] | cleaning stage (`processed.json`) | ingestor, analysis |
//! | [`UploadRecord`] | uploader | project aggregate |
//! | [`ProjectAggregate`] | uploader | history API |
//! | [`EventNotification`] | ingestor / publisher | event consumers |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version stamped into every staged JSON document.
///
/// Readers accept a missing field as version 1.
pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Page context reported by the capture agent alongside a screenshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureContext {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Selected screen area, opaque to the pipeline.
    #[serde(default)]
    pub area: serde_json::Value,
}

/// One screenshot + HTML + metadata snapshot, as received at the boundary.
///
/// Immutable after construction; the cleaning stage only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureArtifact {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub session_id: String,
    /// Filesystem-safe capture timestamp, e.g. `2024-01-31T10-15-00-000Z`.
    pub timestamp: String,
    /// Decoded JPEG bytes.
    #[serde(skip)]
    pub image: Vec<u8>,
    #[serde(default)]
    pub html: Option<String>,
    pub metadata: CaptureContext,
}

/// Paths of the raw files a cleaned artifact was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalPaths {
    pub image: String,
    pub html: Option<String>,
    pub meta: String,
}

/// Metadata block of `processed.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub timestamp: String,
    pub capture_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<OriginalPaths>,
}

/// A bounded structural fragment derived from one HTML element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub tag: String,
    /// Allow-listed, non-empty attributes only. Ordered for stable output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        rename = "rawHTML",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub raw_html: Option<String>,
    #[serde(default)]
    pub children: Vec<ContentChunk>,
}

impl ContentChunk {
    /// A chunk is worth emitting only if it carries text or attributes.
    pub fn has_content(&self) -> bool {
        self.text.as_ref().is_some_and(|t| !t.is_empty())
            || self.attrs.as_ref().is_some_and(|a| !a.is_empty())
    }
}

/// The `processed.json` document written for every cleaned capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedDocument {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub metadata: CaptureMetadata,
    pub structure: Vec<ContentChunk>,
}

/// Classification used by the blob store and project aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Json,
    Text,
    Other,
}

impl FileType {
    /// Classify by file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => FileType::Image,
            "json" => FileType::Json,
            "txt" | "md" | "html" | "css" | "js" => FileType::Text,
            _ => FileType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Json => "json",
            FileType::Text => "text",
            FileType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => FileType::Image,
            "json" => FileType::Json,
            "text" => FileType::Text,
            _ => FileType::Other,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file reference held by a [`ProjectAggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub file_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub relative_path: String,
    pub content_type: String,
    pub size: i64,
    pub upload_date: DateTime<Utc>,
}

/// Default status for projects created by the uploader.
pub const STATUS_IMPORTED: &str = "imported";

/// All uploaded files belonging to one top-level staging folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectAggregate {
    pub id: String,
    pub project_name: String,
    pub user_id: String,
    pub status: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub structured_data: Option<serde_json::Value>,
    #[serde(default)]
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<UploadRecord>,
}

impl ProjectAggregate {
    /// A fresh aggregate with status `imported`.
    pub fn new(project_name: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_name: project_name.to_string(),
            user_id: user_id.to_string(),
            status: STATUS_IMPORTED.to_string(),
            image_url: None,
            structured_data: None,
            prompt: None,
            created_at: now,
            updated_at: now,
            files: Vec::new(),
        }
    }

    /// Append `record`, or replace the existing one with the same
    /// `(filename, relative_path)`.
    pub fn upsert_file(&mut self, record: UploadRecord) {
        match self
            .files
            .iter_mut()
            .find(|f| f.filename == record.filename && f.relative_path == record.relative_path)
        {
            Some(existing) => *existing = record,
            None => self.files.push(record),
        }
    }
}

/// How an event reached the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Stream,
    Direct,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Stream => "stream",
            DeliveryMethod::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "stream" {
            DeliveryMethod::Stream
        } else {
            DeliveryMethod::Direct
        }
    }
}

/// The message body published when an artifact finishes ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    pub prompt_text: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub processed_data: Option<serde_json::Value>,
}

/// A completion event as persisted in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub received_at: DateTime<Utc>,
    pub delivery_method: DeliveryMethod,
    #[serde(default)]
    pub stream_offset: Option<i64>,
}

impl EventNotification {
    pub fn new(payload: EventPayload, delivery_method: DeliveryMethod) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            received_at: Utc::now(),
            delivery_method,
            stream_offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_classification() {
        assert_eq!(FileType::from_extension("JPG"), FileType::Image);
        assert_eq!(FileType::from_extension("webp"), FileType::Image);
        assert_eq!(FileType::from_extension("json"), FileType::Json);
        assert_eq!(FileType::from_extension("md"), FileType::Text);
        assert_eq!(FileType::from_extension("zip"), FileType::Other);
        assert_eq!(FileType::parse(FileType::Text.as_str()), FileType::Text);
    }

    #[test]
    fn test_upsert_file_replaces_same_key() {
        let mut project = ProjectAggregate::new("session-1_abc", "system");
        let record = |id: &str, rel: &str| UploadRecord {
            file_id: id.to_string(),
            filename: "analysis.txt".to_string(),
            file_type: FileType::Text,
            relative_path: rel.to_string(),
            content_type: "text/plain".to_string(),
            size: 10,
            upload_date: Utc::now(),
        };
        project.upsert_file(record("a", "session-1_abc/analysis.txt"));
        project.upsert_file(record("b", "session-1_abc/analysis.txt"));
        project.upsert_file(record("c", "other/analysis.txt"));
        assert_eq!(project.files.len(), 2);
        assert_eq!(project.files[0].file_id, "b");
        assert_eq!(project.status, STATUS_IMPORTED);
    }

    #[test]
    fn test_processed_json_wire_names() {
        let doc = ChunkedDocument {
            schema_version: SCHEMA_VERSION,
            metadata: CaptureMetadata {
                url: "https://example.com".into(),
                title: "Example".into(),
                timestamp: "t".into(),
                capture_time: "t".into(),
                original_path: None,
            },
            structure: vec![ContentChunk {
                tag: "div".into(),
                attrs: None,
                text: None,
                raw_html: Some("<div></div>".into()),
                children: vec![],
            }],
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["metadata"]["captureTime"], "t");
        assert_eq!(json["structure"][0]["rawHTML"], "<div></div>");
        assert!(json["structure"][0].get("attrs").is_none());

        let legacy = r#"{"metadata":{"timestamp":"t","captureTime":"t"},"structure":[]}"#;
        let parsed: ChunkedDocument = serde_json::from_str(legacy).unwrap();
        assert_eq!(parsed.schema_version, 1);
    }

    #[test]
    fn test_event_notification_flattens_payload() {
        let event = EventNotification::new(
            EventPayload {
                schema_version: SCHEMA_VERSION,
                prompt_text: "report".into(),
                image_url: None,
                processed_data: None,
            },
            DeliveryMethod::Direct,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["promptText"], "report");
        assert_eq!(json["deliveryMethod"], "direct");
    }
}
