//! In-memory [`ProjectStore`] and [`EventStore`] for tests and dry runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DeliveryMethod, EventNotification, ProjectAggregate};

use super::{EventStore, ProjectStore};

/// In-memory project store keyed by project name.
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<String, ProjectAggregate>>,
    saves: RwLock<usize>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            saves: RwLock::new(0),
        }
    }

    /// How many times [`ProjectStore::save_project`] has been called.
    pub fn save_count(&self) -> usize {
        *self.saves.read().unwrap()
    }
}

impl Default for InMemoryProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn find_project(&self, project_name: &str) -> Result<Option<ProjectAggregate>> {
        Ok(self.projects.read().unwrap().get(project_name).cloned())
    }

    async fn get_project(&self, id: &str) -> Result<Option<ProjectAggregate>> {
        Ok(self
            .projects
            .read()
            .unwrap()
            .values()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn save_project(&self, project: &ProjectAggregate) -> Result<()> {
        self.projects
            .write()
            .unwrap()
            .insert(project.project_name.clone(), project.clone());
        *self.saves.write().unwrap() += 1;
        Ok(())
    }

    async fn list_projects(&self, user_id: &str) -> Result<Vec<ProjectAggregate>> {
        let mut projects: Vec<ProjectAggregate> = self
            .projects
            .read()
            .unwrap()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }
}

/// In-memory event collection, kept in insertion order.
pub struct InMemoryEventStore {
    events: RwLock<Vec<EventNotification>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert_event(&self, event: &EventNotification) -> Result<()> {
        self.events.write().unwrap().push(event.clone());
        Ok(())
    }

    async fn events_after(
        &self,
        method: DeliveryMethod,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventNotification>> {
        let mut matching: Vec<EventNotification> = self
            .events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.delivery_method == method)
            .filter(|e| after.map_or(true, |w| e.received_at > w))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        matching.truncate(limit);
        Ok(matching)
    }

    async fn count_events(&self) -> Result<i64> {
        Ok(self.events.read().unwrap().len() as i64)
    }

    async fn last_stream_offset(&self) -> Result<Option<i64>> {
        Ok(self
            .events
            .read()
            .unwrap()
            .iter()
            .filter_map(|e| e.stream_offset)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventPayload, SCHEMA_VERSION};

    fn event(text: &str, micros: i64, method: DeliveryMethod) -> EventNotification {
        let mut e = EventNotification::new(
            EventPayload {
                schema_version: SCHEMA_VERSION,
                prompt_text: text.to_string(),
                image_url: None,
                processed_data: None,
            },
            method,
        );
        e.received_at = DateTime::from_timestamp_micros(micros).unwrap();
        e
    }

    #[tokio::test]
    async fn test_events_after_orders_and_limits() {
        let store = InMemoryEventStore::new();
        store.insert_event(&event("c", 30, DeliveryMethod::Direct)).await.unwrap();
        store.insert_event(&event("a", 10, DeliveryMethod::Direct)).await.unwrap();
        store.insert_event(&event("s", 15, DeliveryMethod::Stream)).await.unwrap();
        store.insert_event(&event("b", 20, DeliveryMethod::Direct)).await.unwrap();

        let all = store.events_after(DeliveryMethod::Direct, None, 10).await.unwrap();
        let texts: Vec<&str> = all.iter().map(|e| e.payload.prompt_text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);

        let after = DateTime::from_timestamp_micros(10).unwrap();
        let rest = store.events_after(DeliveryMethod::Direct, Some(after), 1).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload.prompt_text, "b");
        assert_eq!(store.count_events().await.unwrap(), 4);
        assert_eq!(store.last_stream_offset().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_project_roundtrip_by_name_and_id() {
        let store = InMemoryProjectStore::new();
        let project = ProjectAggregate::new("session-1_t", "system");
        store.save_project(&project).await.unwrap();

        let by_name = store.find_project("session-1_t").await.unwrap().unwrap();
        assert_eq!(by_name.id, project.id);
        assert!(store.get_project(&project.id).await.unwrap().is_some());
        assert_eq!(store.list_projects("system").await.unwrap().len(), 1);
        assert!(store.list_projects("someone").await.unwrap().is_empty());
        assert_eq!(store.save_count(), 1);
    }
}
