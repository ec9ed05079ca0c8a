//! Storage abstraction for project aggregates and completion events.
//!
//! The uploader and the event path only talk to these traits, so the
//! SQLite backend in the application crate and the in-memory backend in
//! [`memory`] are interchangeable. Implementations must be `Send + Sync`
//! to be shared across tokio tasks.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DeliveryMethod, EventNotification, ProjectAggregate};

/// Persistence for [`ProjectAggregate`]s.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_project`](ProjectStore::find_project) | Look up by project name |
/// | [`get_project`](ProjectStore::get_project) | Look up by id |
/// | [`save_project`](ProjectStore::save_project) | Insert or update, including file records |
/// | [`list_projects`](ProjectStore::list_projects) | All projects of a user, newest first |
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_project(&self, project_name: &str) -> Result<Option<ProjectAggregate>>;

    async fn get_project(&self, id: &str) -> Result<Option<ProjectAggregate>>;

    /// Persist the aggregate and its full file list in one step.
    async fn save_project(&self, project: &ProjectAggregate) -> Result<()>;

    async fn list_projects(&self, user_id: &str) -> Result<Vec<ProjectAggregate>>;
}

/// Persistence for [`EventNotification`]s.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: &EventNotification) -> Result<()>;

    /// Events of the given delivery method with `received_at` strictly
    /// after `after` (all when `None`), oldest first, at most `limit`.
    async fn events_after(
        &self,
        method: DeliveryMethod,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventNotification>>;

    /// Number of stored events.
    async fn count_events(&self) -> Result<i64>;

    /// Highest broker offset persisted from the stream, if any.
    async fn last_stream_offset(&self) -> Result<Option<i64>>;
}
