//! Completion events: publish, consume, and the direct-store fallback.
//!
//! When an artifact finishes ingestion an [`EventPayload`] is published.
//! Transport is decided once at startup by [`select_transport`]:
//!
//! ```text
//!                    probe ok                        StreamConsumer
//! EventPublisher ──▶ Broker ──▶ topic/partition ──▶ (deliveryMethod=stream)
//!       │                                                  │
//!       │ no broker / probe failed / publish failed        ▼
//!       └──────────────▶ direct insert ───────────▶   EventStore
//!                    (deliveryMethod=direct)               ▲
//!                                                          │ poll > watermark
//!                                                   FallbackConsumer
//! ```
//!
//! The fallback consumer's watermark lives in memory only, so a restarted
//! consumer starts again from the beginning of the direct records.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use capture_harness_core::models::{
    DeliveryMethod, EventNotification, EventPayload, SCHEMA_VERSION,
};
use capture_harness_core::store::EventStore;

use crate::config::EventsConfig;

/// One record read back from a broker partition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamRecord {
    pub offset: i64,
    #[serde(default)]
    pub key: Option<String>,
    pub value: serde_json::Value,
}

/// A topic on a record broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Check the broker is reachable and the topic exists.
    async fn probe(&self) -> Result<()>;

    /// Append a record. Returns its offset.
    async fn publish(&self, key: &str, value: &serde_json::Value) -> Result<i64>;

    /// Up to `max` records of `partition` starting at `offset`.
    async fn fetch(&self, partition: u32, offset: i64, max: usize) -> Result<Vec<StreamRecord>>;
}

/// Broker spoken to over a small REST record API.
///
/// | Operation | Request |
/// |-----------|---------|
/// | probe | `GET {base}/topics/{topic}` |
/// | publish | `POST {base}/topics/{topic}/records` with `{key, value}` → `{offset}` |
/// | fetch | `GET {base}/topics/{topic}/partitions/{p}/records?offset=&max=` → `{records}` |
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    topic: String,
}

#[derive(Deserialize)]
struct PublishResponse {
    offset: i64,
}

#[derive(Deserialize)]
struct FetchResponse {
    #[serde(default)]
    records: Vec<StreamRecord>,
}

impl HttpBroker {
    pub fn new(base_url: &str, topic: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build broker HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            topic: topic.to_string(),
        })
    }

    fn topic_url(&self) -> String {
        format!("{}/topics/{}", self.base_url, self.topic)
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn probe(&self) -> Result<()> {
        let resp = self.client.get(self.topic_url()).send().await?;
        if !resp.status().is_success() {
            bail!("broker probe returned {}", resp.status());
        }
        Ok(())
    }

    async fn publish(&self, key: &str, value: &serde_json::Value) -> Result<i64> {
        let resp = self
            .client
            .post(format!("{}/records", self.topic_url()))
            .json(&json!({ "key": key, "value": value }))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("broker publish returned {}", resp.status());
        }
        Ok(resp.json::<PublishResponse>().await?.offset)
    }

    async fn fetch(&self, partition: u32, offset: i64, max: usize) -> Result<Vec<StreamRecord>> {
        let resp = self
            .client
            .get(format!("{}/partitions/{}/records", self.topic_url(), partition))
            .query(&[("offset", offset.to_string()), ("max", max.to_string())])
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("broker fetch returned {}", resp.status());
        }
        Ok(resp.json::<FetchResponse>().await?.records)
    }
}

/// How events leave this process. Fixed for the lifetime of the process.
#[derive(Clone)]
pub enum Transport {
    Stream(Arc<dyn Broker>),
    Direct,
}

impl Transport {
    pub fn method(&self) -> DeliveryMethod {
        match self {
            Transport::Stream(_) => DeliveryMethod::Stream,
            Transport::Direct => DeliveryMethod::Direct,
        }
    }
}

/// Probe the configured broker once.
pub async fn select_transport(config: &EventsConfig) -> Transport {
    let Some(url) = &config.broker_url else {
        tracing::info!("no broker configured, events go directly to the store");
        return Transport::Direct;
    };

    let broker = match HttpBroker::new(
        url,
        &config.topic,
        Duration::from_secs(config.probe_timeout_secs),
    ) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "broker client unavailable, using direct store");
            return Transport::Direct;
        }
    };

    match broker.probe().await {
        Ok(()) => {
            tracing::info!(broker = %url, topic = %config.topic, "publishing events to broker");
            Transport::Stream(Arc::new(broker))
        }
        Err(e) => {
            tracing::warn!(broker = %url, error = %e, "broker unreachable, using direct store");
            Transport::Direct
        }
    }
}

/// Issues strictly increasing microsecond timestamps.
struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let now = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap_or_default();
        let mut last = self.last.lock().unwrap();
        let next = match *last {
            Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

pub struct EventPublisher {
    transport: Transport,
    store: Arc<dyn EventStore>,
    clock: MonotonicClock,
}

impl EventPublisher {
    pub fn new(transport: Transport, store: Arc<dyn EventStore>) -> Self {
        Self {
            transport,
            store,
            clock: MonotonicClock::new(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Publish one event. Returns how it was delivered.
    ///
    /// A broker failure falls back to a direct insert for this message only.
    pub async fn publish(&self, payload: EventPayload) -> Result<DeliveryMethod> {
        if let Transport::Stream(broker) = &self.transport {
            let key = uuid::Uuid::new_v4().to_string();
            let value = serde_json::to_value(&payload)?;
            match broker.publish(&key, &value).await {
                Ok(offset) => {
                    tracing::info!(offset, "event published to broker");
                    return Ok(DeliveryMethod::Stream);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker publish failed, storing directly");
                }
            }
        }

        let mut event = EventNotification::new(payload, DeliveryMethod::Direct);
        event.received_at = self.clock.now();
        self.store.insert_event(&event).await?;
        tracing::info!(id = %event.id, "event stored directly");
        Ok(DeliveryMethod::Direct)
    }
}

/// Accepts both structured payloads and bare prompt strings.
fn payload_from_value(value: serde_json::Value) -> Result<EventPayload> {
    match value {
        serde_json::Value::String(prompt_text) => Ok(EventPayload {
            schema_version: SCHEMA_VERSION,
            prompt_text,
            image_url: None,
            processed_data: None,
        }),
        other => Ok(serde_json::from_value(other)?),
    }
}

/// Reads one broker partition and persists each record.
pub struct StreamConsumer {
    broker: Arc<dyn Broker>,
    store: Arc<dyn EventStore>,
    partition: u32,
    next_offset: i64,
    batch_limit: usize,
}

impl StreamConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn EventStore>,
        partition: u32,
        start_offset: i64,
        batch_limit: usize,
    ) -> Self {
        Self {
            broker,
            store,
            partition,
            next_offset: start_offset,
            batch_limit,
        }
    }

    /// Resume after the highest offset already in the store.
    pub async fn resume(
        broker: Arc<dyn Broker>,
        store: Arc<dyn EventStore>,
        config: &EventsConfig,
    ) -> Result<Self> {
        let start = store.last_stream_offset().await?.map_or(0, |o| o + 1);
        Ok(Self::new(broker, store, config.partition, start, config.batch_limit))
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Fetch and persist one batch. Returns how many records were stored.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let records = self
            .broker
            .fetch(self.partition, self.next_offset, self.batch_limit)
            .await?;

        let mut stored = 0;
        for record in records {
            self.next_offset = self.next_offset.max(record.offset + 1);
            let payload = match payload_from_value(record.value) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(offset = record.offset, error = %e, "skipping malformed record");
                    continue;
                }
            };
            let mut event = EventNotification::new(payload, DeliveryMethod::Stream);
            event.stream_offset = Some(record.offset);
            self.store.insert_event(&event).await?;
            tracing::info!(offset = record.offset, "event received from stream");
            stored += 1;
        }
        Ok(stored)
    }

    pub async fn run(mut self, interval: Duration) {
        tracing::info!(partition = self.partition, offset = self.next_offset, "stream consumer running");
        loop {
            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "stream poll failed");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Polls the directly inserted records, oldest first.
pub struct FallbackConsumer {
    store: Arc<dyn EventStore>,
    watermark: Option<DateTime<Utc>>,
    batch_limit: usize,
}

impl FallbackConsumer {
    pub fn new(store: Arc<dyn EventStore>, batch_limit: usize) -> Self {
        Self {
            store,
            watermark: None,
            batch_limit,
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Records newer than the watermark. Advances the watermark; never
    /// modifies the store.
    pub async fn poll_once(&mut self) -> Result<Vec<EventNotification>> {
        let events = self
            .store
            .events_after(DeliveryMethod::Direct, self.watermark, self.batch_limit)
            .await?;
        if let Some(max) = events.iter().map(|e| e.received_at).max() {
            self.watermark = Some(self.watermark.map_or(max, |w| w.max(max)));
        }
        Ok(events)
    }

    pub async fn run(mut self, interval: Duration) {
        tracing::info!(interval_secs = interval.as_secs(), "polling direct events");
        loop {
            match self.poll_once().await {
                Ok(events) => {
                    for event in &events {
                        let preview: String = event.payload.prompt_text.chars().take(30).collect();
                        tracing::info!(id = %event.id, prompt = %preview, "direct event");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "direct poll failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
