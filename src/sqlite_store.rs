//! SQLite-backed [`ProjectStore`] and [`EventStore`].
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! ordering by `received_at` matches the in-memory store exactly. JSON
//! fields (`structured_data`, `processed_data`) are stored as text.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use capture_harness_core::models::{
    DeliveryMethod, EventNotification, EventPayload, FileType, ProjectAggregate, UploadRecord,
};
use capture_harness_core::store::{EventStore, ProjectStore};

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn parse_json(text: Option<String>) -> Option<serde_json::Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

pub struct SqliteProjectStore {
    pool: SqlitePool,
}

impl SqliteProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_files(&self, project_id: &str) -> Result<Vec<UploadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT file_id, filename, file_type, relative_path, content_type, size, upload_date
            FROM project_files
            WHERE project_id = ?
            ORDER BY position
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let file_type: String = row.get("file_type");
                UploadRecord {
                    file_id: row.get("file_id"),
                    filename: row.get("filename"),
                    file_type: FileType::parse(&file_type),
                    relative_path: row.get("relative_path"),
                    content_type: row.get("content_type"),
                    size: row.get("size"),
                    upload_date: from_micros(row.get("upload_date")),
                }
            })
            .collect())
    }

    async fn hydrate(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ProjectAggregate> {
        let id: String = row.get("id");
        let files = self.load_files(&id).await?;
        Ok(ProjectAggregate {
            id,
            project_name: row.get("project_name"),
            user_id: row.get("user_id"),
            status: row.get("status"),
            image_url: row.get("image_url"),
            structured_data: parse_json(row.get("structured_data")),
            prompt: row.get("prompt"),
            created_at: from_micros(row.get("created_at")),
            updated_at: from_micros(row.get("updated_at")),
            files,
        })
    }
}

const SELECT_PROJECT: &str = r#"
    SELECT id, project_name, user_id, status, image_url, structured_data, prompt,
           created_at, updated_at
    FROM projects
"#;

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn find_project(&self, project_name: &str) -> Result<Option<ProjectAggregate>> {
        let row = sqlx::query(&format!("{} WHERE project_name = ?", SELECT_PROJECT))
            .bind(project_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_project(&self, id: &str) -> Result<Option<ProjectAggregate>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_PROJECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn save_project(&self, project: &ProjectAggregate) -> Result<()> {
        let structured = project
            .structured_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO projects (id, project_name, user_id, status, image_url,
                                  structured_data, prompt, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_name = excluded.project_name,
                user_id = excluded.user_id,
                status = excluded.status,
                image_url = excluded.image_url,
                structured_data = excluded.structured_data,
                prompt = excluded.prompt,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&project.id)
        .bind(&project.project_name)
        .bind(&project.user_id)
        .bind(&project.status)
        .bind(&project.image_url)
        .bind(&structured)
        .bind(&project.prompt)
        .bind(project.created_at.timestamp_micros())
        .bind(project.updated_at.timestamp_micros())
        .execute(&mut *tx)
        .await?;

        // The file list is rewritten as a whole
        sqlx::query("DELETE FROM project_files WHERE project_id = ?")
            .bind(&project.id)
            .execute(&mut *tx)
            .await?;

        for (position, file) in project.files.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO project_files (project_id, file_id, filename, file_type,
                                           relative_path, content_type, size,
                                           upload_date, position)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&project.id)
            .bind(&file.file_id)
            .bind(&file.filename)
            .bind(file.file_type.as_str())
            .bind(&file.relative_path)
            .bind(&file.content_type)
            .bind(file.size)
            .bind(file.upload_date.timestamp_micros())
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_projects(&self, user_id: &str) -> Result<Vec<ProjectAggregate>> {
        let rows = sqlx::query(&format!(
            "{} WHERE user_id = ? ORDER BY created_at DESC",
            SELECT_PROJECT
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in &rows {
            projects.push(self.hydrate(row).await?);
        }
        Ok(projects)
    }
}

pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert_event(&self, event: &EventNotification) -> Result<()> {
        let processed = event
            .payload
            .processed_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO received_events (id, prompt_text, image_url, processed_data,
                                         schema_version, received_at, delivery_method,
                                         stream_offset)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.payload.prompt_text)
        .bind(&event.payload.image_url)
        .bind(&processed)
        .bind(i64::from(event.payload.schema_version))
        .bind(event.received_at.timestamp_micros())
        .bind(event.delivery_method.as_str())
        .bind(event.stream_offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_after(
        &self,
        method: DeliveryMethod,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventNotification>> {
        let after_micros = after.map(|t| t.timestamp_micros()).unwrap_or(i64::MIN);
        let rows = sqlx::query(
            r#"
            SELECT id, prompt_text, image_url, processed_data, schema_version,
                   received_at, delivery_method, stream_offset
            FROM received_events
            WHERE delivery_method = ? AND received_at > ?
            ORDER BY received_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(method.as_str())
        .bind(after_micros)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let method: String = row.get("delivery_method");
                let version: i64 = row.get("schema_version");
                EventNotification {
                    id: row.get("id"),
                    payload: EventPayload {
                        schema_version: version as u32,
                        prompt_text: row.get("prompt_text"),
                        image_url: row.get("image_url"),
                        processed_data: parse_json(row.get("processed_data")),
                    },
                    received_at: from_micros(row.get("received_at")),
                    delivery_method: DeliveryMethod::parse(&method),
                    stream_offset: row.get("stream_offset"),
                }
            })
            .collect())
    }

    async fn count_events(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM received_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn last_stream_offset(&self) -> Result<Option<i64>> {
        let (offset,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(stream_offset) FROM received_events")
                .fetch_one(&self.pool)
                .await?;
        Ok(offset)
    }
}
