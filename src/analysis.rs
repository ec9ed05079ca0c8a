//! Chunked analysis client.
//!
//! Sends a combined capture payload to an OpenAI-compatible
//! chat-completions endpoint (Groq by default) and assembles the answers
//! into a plain-text report.
//!
//! # Flow
//!
//! ```text
//! payload ──split_into_segments──▶ [seg 1] [seg 2] … [seg n]
//!                                     │ sequential, with retry
//!                                     ▼
//!                             [out 1] [  ✗  ] … [out n]
//!                                     │ >1 success
//!                                     ▼
//!                              summary request ──▶ report
//! ```
//!
//! # Retry Policy
//!
//! Each request is attempted up to `max_attempts` times:
//!
//! | Failure | Action |
//! |---------|--------|
//! | 401 / 403 | give up on the segment immediately |
//! | 429 | wait `2 × retry_delay`, then the normal `retry_delay`, retry |
//! | timeout, network, 5xx, other | wait `retry_delay`, retry |
//!
//! A segment that exhausts its attempts contributes nothing; the other
//! segments still run. If no segment succeeds the result is `None`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use capture_harness_core::segment::split_into_segments;

use crate::config::AnalysisConfig;
use crate::error::ApiError;

/// One prompt in, one completion out.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ApiError>;
}

/// Produces a report for a combined payload, or `None` when nothing could
/// be analyzed.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, payload: &str) -> Option<AnalysisReport>;
}

/// HTTP client for `POST {base_url}` chat completions.
pub struct ChatCompletionsApi {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionsApi {
    /// Build from config, reading the API key from `api_key_env`.
    ///
    /// Fails when the key is not set so that the caller can run without
    /// analysis instead.
    pub fn from_config(config: &AnalysisConfig) -> anyhow::Result<Self> {
        if !config.is_enabled() {
            anyhow::bail!("analysis provider is disabled");
        }
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &AnalysisConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[async_trait]
impl CompletionApi for ChatCompletionsApi {
    async fn complete(&self, prompt: &str) -> Result<String, ApiError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body_text));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Generic(format!("invalid completion response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ApiError::Generic("completion response has no choices".to_string()))
    }
}

/// Attempt budget and base delay for each request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    fn delay_after(&self, err: &ApiError) -> Duration {
        match err {
            ApiError::RateLimited => self.base_delay * 3,
            _ => self.base_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl SegmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentState::Done | SegmentState::Failed)
    }
}

/// One bounded slice of the payload and its outcome.
#[derive(Debug, Clone)]
pub struct Segment {
    pub text: String,
    pub state: SegmentState,
    pub attempts: u32,
    pub output: Option<String>,
}

/// Segments of one payload plus the shared context header.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub context: WebsiteContext,
    pub segments: Vec<Segment>,
}

impl AnalysisJob {
    pub fn new(payload: &str, max_segment_chars: usize) -> Self {
        let segments = split_into_segments(payload, max_segment_chars)
            .into_iter()
            .map(|text| Segment {
                text,
                state: SegmentState::Pending,
                attempts: 0,
                output: None,
            })
            .collect();
        Self {
            context: WebsiteContext::from_payload(payload),
            segments,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|s| s.state.is_terminal())
    }

    pub fn successful_outputs(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| s.output.as_deref())
            .collect()
    }
}

/// Page facts used to build prompt headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebsiteContext {
    pub url: String,
    pub title: String,
    pub domain: String,
    pub timestamp: String,
}

impl WebsiteContext {
    /// Read `metadata.url`, `metadata.title`, and `metadata.timestamp` from a
    /// JSON payload. Anything unparseable yields empty fields.
    pub fn from_payload(payload: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };
        let field = |name: &str| {
            value
                .pointer(&format!("/metadata/{}", name))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let url = field("url");
        let domain = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            title: field("title"),
            timestamp: field("timestamp"),
            url,
            domain,
        }
    }

    /// Header prepended to every segment prompt.
    pub fn header(&self) -> String {
        format!(
            "You are analyzing a UI/UX snapshot from {url}\n\
             Page Title: \"{title}\"\n\
             Captured: {timestamp}\n\
             \n\
             Provide a detailed UI/UX analysis of this {domain} page and compare it with the live site at {url}. Cover:\n\
             1. Brand identity and target audience fit\n\
             2. Visual design: color, typography, layout, spacing, imagery\n\
             3. Interface components: navigation, header and footer, calls to action, forms, search\n\
             4. User flow: content organization, interactive feedback, mobile behavior, error states\n\
             5. Technical quality: loading, accessibility, browser compatibility\n\
             6. Specific, actionable recommendations for {domain}",
            url = self.url,
            title = self.title,
            timestamp = self.timestamp,
            domain = self.domain,
        )
    }

    fn segment_prompt(&self, segment: &str) -> String {
        format!(
            "{}\n\nAnalyze this portion of the UI/UX data:\n\n{}",
            self.header(),
            segment
        )
    }

    fn summary_prompt(&self, combined: &str) -> String {
        format!(
            "Provide a detailed executive summary of the UI/UX analysis for {}, focusing on key findings and comparisons with the actual website:\n\n{}",
            self.url, combined
        )
    }
}

/// Final analysis text plus bookkeeping for logs.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub text: String,
    pub summarized: bool,
    pub segments_total: usize,
    pub segments_succeeded: usize,
}

/// Sequential, retrying [`Analyzer`] over a [`CompletionApi`].
pub struct AnalysisClient {
    api: Arc<dyn CompletionApi>,
    policy: RetryPolicy,
    max_segment_chars: usize,
}

impl AnalysisClient {
    pub fn new(api: Arc<dyn CompletionApi>, policy: RetryPolicy, max_segment_chars: usize) -> Self {
        Self {
            api,
            policy,
            max_segment_chars,
        }
    }

    /// Build the HTTP-backed client, failing when no API key is available.
    pub fn from_config(config: &AnalysisConfig) -> anyhow::Result<Self> {
        let api = ChatCompletionsApi::from_config(config)?;
        Ok(Self::new(
            Arc::new(api),
            RetryPolicy::from_config(config),
            config.max_segment_chars,
        ))
    }

    /// Run one prompt through the retry policy.
    ///
    /// Returns the completion (if any) and the number of attempts made.
    pub async fn request_with_retry(&self, prompt: &str) -> (Option<String>, u32) {
        let mut delay = Duration::ZERO;
        let mut attempts = 0;

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            match self.api.complete(prompt).await {
                Ok(text) => return (Some(text), attempts),
                Err(err) if err.is_auth() => {
                    tracing::error!(error = %err, "analysis credentials rejected, not retrying");
                    return (None, attempts);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "analysis request failed"
                    );
                    delay = self.policy.delay_after(&err);
                }
            }
        }

        (None, attempts)
    }

    /// Drive every segment of `job` to a terminal state, in order.
    pub async fn run_job(&self, job: &mut AnalysisJob) {
        let total = job.segments.len();
        for (i, segment) in job.segments.iter_mut().enumerate() {
            segment.state = SegmentState::InFlight;
            tracing::debug!(segment = i + 1, total, "analyzing segment");

            let prompt = job.context.segment_prompt(&segment.text);
            let (output, attempts) = self.request_with_retry(&prompt).await;
            segment.attempts = attempts;
            segment.state = if output.is_some() {
                SegmentState::Done
            } else {
                tracing::warn!(segment = i + 1, total, "segment produced no analysis");
                SegmentState::Failed
            };
            segment.output = output;
        }
    }
}

#[async_trait]
impl Analyzer for AnalysisClient {
    async fn analyze(&self, payload: &str) -> Option<AnalysisReport> {
        let mut job = AnalysisJob::new(payload, self.max_segment_chars);
        self.run_job(&mut job).await;
        debug_assert!(job.is_complete());

        let outputs = job.successful_outputs();
        if outputs.is_empty() {
            return None;
        }
        let detailed = outputs.join("\n\n");
        let segments_total = job.segments.len();
        let segments_succeeded = outputs.len();

        if segments_succeeded > 1 {
            let (summary, _) = self
                .request_with_retry(&job.context.summary_prompt(&detailed))
                .await;
            if let Some(summary) = summary {
                let text = format!(
                    "Website Analysis: {}\nPage Title: {}\nAnalysis Time: {}\n\nEXECUTIVE SUMMARY:\n{}\n\nDETAILED ANALYSIS:\n{}\n",
                    job.context.url,
                    job.context.title,
                    Utc::now().to_rfc3339(),
                    summary,
                    detailed
                );
                return Some(AnalysisReport {
                    text,
                    summarized: true,
                    segments_total,
                    segments_succeeded,
                });
            }
            tracing::warn!("summary request failed, keeping unsummarized analysis");
        }

        Some(AnalysisReport {
            text: format!("{}\n", detailed),
            summarized: false,
            segments_total,
            segments_succeeded,
        })
    }
}
