use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Blob metadata, one row per uploaded file
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            parent_directory TEXT NOT NULL,
            upload_date INTEGER NOT NULL,
            original_path TEXT NOT NULL,
            project_name TEXT,
            relative_path TEXT,
            sha256 TEXT NOT NULL,
            chunk_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Blob content, split into fixed-size pieces
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blob_chunks (
            blob_id TEXT NOT NULL,
            n INTEGER NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (blob_id, n),
            FOREIGN KEY (blob_id) REFERENCES blobs(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            project_name TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            image_url TEXT,
            structured_data TEXT,
            prompt TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_files (
            project_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            upload_date INTEGER NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (project_id, filename, relative_path),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Completion events; received_at is microseconds since the epoch
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS received_events (
            id TEXT PRIMARY KEY,
            prompt_text TEXT NOT NULL,
            image_url TEXT,
            processed_data TEXT,
            schema_version INTEGER NOT NULL DEFAULT 1,
            received_at INTEGER NOT NULL,
            delivery_method TEXT NOT NULL,
            stream_offset INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id, created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_method_received ON received_events(delivery_method, received_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_blobs_project ON blobs(project_name)")
        .execute(pool)
        .await?;

    Ok(())
}
