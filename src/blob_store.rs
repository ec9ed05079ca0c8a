//! Chunked blob storage.
//!
//! Uploaded files are stored the way GridFS stores them: one metadata row in
//! `blobs` and the content split into fixed-size rows in `blob_chunks`. A
//! file is streamed from disk in [`CHUNK_SIZE`] pieces inside a single
//! transaction, so readers never observe a partially written blob and
//! [`BlobStore::put`] returns only after the commit has succeeded.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::io::AsyncReadExt;

use capture_harness_core::models::FileType;

use crate::error::StorageError;

/// Size of one stored content piece.
pub const CHUNK_SIZE: usize = 255 * 1024;

/// Metadata persisted alongside every blob.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub filename: String,
    pub content_type: String,
    pub file_size: i64,
    pub file_type: FileType,
    pub parent_directory: String,
    pub upload_date: DateTime<Utc>,
    pub original_path: String,
    pub project_name: Option<String>,
    pub relative_path: Option<String>,
}

/// A committed blob's metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    pub id: String,
    #[serde(flatten)]
    pub metadata: BlobMetadata,
    pub sha256: String,
    pub chunk_count: i64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `source` into the store. Returns the new blob id once committed.
    async fn put(&self, metadata: &BlobMetadata, source: &Path) -> Result<String, StorageError>;

    /// Metadata and full content of a blob.
    async fn get(&self, id: &str) -> Result<Option<(StoredBlob, Vec<u8>)>, StorageError>;

    /// Most recent blob with this filename in a project.
    async fn find_latest(
        &self,
        project_name: &str,
        filename: &str,
    ) -> Result<Option<StoredBlob>, StorageError>;
}

pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_blob(row: &sqlx::sqlite::SqliteRow) -> StoredBlob {
    let upload_micros: i64 = row.get("upload_date");
    let file_type: String = row.get("file_type");
    StoredBlob {
        id: row.get("id"),
        metadata: BlobMetadata {
            filename: row.get("filename"),
            content_type: row.get("content_type"),
            file_size: row.get("file_size"),
            file_type: FileType::parse(&file_type),
            parent_directory: row.get("parent_directory"),
            upload_date: DateTime::from_timestamp_micros(upload_micros).unwrap_or_default(),
            original_path: row.get("original_path"),
            project_name: row.get("project_name"),
            relative_path: row.get("relative_path"),
        },
        sha256: row.get("sha256"),
        chunk_count: row.get("chunk_count"),
    }
}

const SELECT_BLOB: &str = r#"
    SELECT id, filename, content_type, file_size, file_type, parent_directory,
           upload_date, original_path, project_name, relative_path, sha256, chunk_count
    FROM blobs
"#;

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, metadata: &BlobMetadata, source: &Path) -> Result<String, StorageError> {
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| StorageError::io(source, e))?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO blobs (id, filename, content_type, file_size, file_type,
                               parent_directory, upload_date, original_path,
                               project_name, relative_path, sha256, chunk_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '', 0)
            "#,
        )
        .bind(&id)
        .bind(&metadata.filename)
        .bind(&metadata.content_type)
        .bind(metadata.file_size)
        .bind(metadata.file_type.as_str())
        .bind(&metadata.parent_directory)
        .bind(metadata.upload_date.timestamp_micros())
        .bind(&metadata.original_path)
        .bind(&metadata.project_name)
        .bind(&metadata.relative_path)
        .execute(&mut *tx)
        .await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut n: i64 = 0;
        let mut total: i64 = 0;

        loop {
            // Fill a whole chunk unless the file ends first
            let mut filled = 0;
            while filled < CHUNK_SIZE {
                let read = file
                    .read(&mut buf[filled..])
                    .await
                    .map_err(|e| StorageError::io(source, e))?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            if filled == 0 {
                break;
            }

            hasher.update(&buf[..filled]);
            sqlx::query("INSERT INTO blob_chunks (blob_id, n, data) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(n)
                .bind(&buf[..filled])
                .execute(&mut *tx)
                .await?;
            n += 1;
            total += filled as i64;

            if filled < CHUNK_SIZE {
                break;
            }
        }

        let digest = format!("{:x}", hasher.finalize());
        sqlx::query("UPDATE blobs SET sha256 = ?, chunk_count = ?, file_size = ? WHERE id = ?")
            .bind(&digest)
            .bind(n)
            .bind(total)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<(StoredBlob, Vec<u8>)>, StorageError> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_BLOB))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let blob = row_to_blob(&row);

        let chunks = sqlx::query("SELECT data FROM blob_chunks WHERE blob_id = ? ORDER BY n")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let mut data = Vec::with_capacity(blob.metadata.file_size.max(0) as usize);
        for chunk in chunks {
            let piece: Vec<u8> = chunk.get("data");
            data.extend_from_slice(&piece);
        }
        Ok(Some((blob, data)))
    }

    async fn find_latest(
        &self,
        project_name: &str,
        filename: &str,
    ) -> Result<Option<StoredBlob>, StorageError> {
        let row = sqlx::query(&format!(
            "{} WHERE project_name = ? AND filename = ? ORDER BY upload_date DESC LIMIT 1",
            SELECT_BLOB
        ))
        .bind(project_name)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_blob))
    }
}
