//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/cap.sqlite"
//!
//! [paths]
//! capture_dir = "./data/captured-images"
//! cleaned_dir = "./data/cleaneddata"
//! prompt_store = "./data/prompt-store"
//!
//! [analysis]
//! provider = "groq"
//! model = "llama3-8b-8192"
//!
//! [events]
//! broker_url = "http://127.0.0.1:9003"
//! ```
//!
//! Every section except `[db]` and `[paths]` is optional and falls back to
//! the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Staging directories shared by the pipeline stages.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Raw captures: `{capture_dir}/{session}/{ts}.jpg|.html|.json`.
    pub capture_dir: PathBuf,
    /// Cleaned artifacts: `{cleaned_dir}/{session}/{ts}/processed.json`.
    pub cleaned_dir: PathBuf,
    /// Analysis outputs awaiting upload.
    pub prompt_store: PathBuf,
}

impl PathsConfig {
    /// Where ingestion lock markers live.
    pub fn lock_dir(&self) -> PathBuf {
        self.prompt_store.join(".processing")
    }

    /// Mirror tree for uploaded files.
    pub fn done_dir(&self) -> PathBuf {
        self.prompt_store.join("done")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleaningConfig {
    #[serde(default = "default_max_html_bytes")]
    pub max_html_bytes: usize,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            max_html_bytes: default_max_html_bytes(),
        }
    }
}

fn default_max_html_bytes() -> usize {
    capture_harness_core::clean::DEFAULT_MAX_HTML_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: default_analysis_provider(),
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_segment_chars: default_max_segment_chars(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl AnalysisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_analysis_provider() -> String {
    "groq".to_string()
}
fn default_base_url() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "llama3-8b-8192".to_string()
}
fn default_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_max_segment_chars() -> usize {
    capture_harness_core::segment::DEFAULT_MAX_SEGMENT_CHARS
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1500
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Directory levels below `cleaned_dir` that are observed.
    #[serde(default = "default_ingest_depth")]
    pub watch_depth: usize,
    /// A file must keep the same size this long before it is handled.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            watch_depth: default_ingest_depth(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_ingest_depth() -> usize {
    2
}
fn default_settle_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_depth")]
    pub watch_depth: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_link_projects")]
    pub link_projects: bool,
    #[serde(default = "default_user")]
    pub default_user: String,
    /// Paths (relative to the prompt store) never uploaded.
    #[serde(default = "default_upload_excludes")]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            watch_depth: default_upload_depth(),
            queue_capacity: default_queue_capacity(),
            link_projects: default_link_projects(),
            default_user: default_user(),
            exclude_globs: default_upload_excludes(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_upload_depth() -> usize {
    5
}
fn default_queue_capacity() -> usize {
    256
}
fn default_link_projects() -> bool {
    true
}
fn default_user() -> String {
    "system".to_string()
}
fn default_upload_excludes() -> Vec<String> {
    vec![
        "done/**".to_string(),
        "**/.*".to_string(),
        "**/.*/**".to_string(),
        "**/node_modules/**".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Base URL of the broker's REST gateway. Unset means direct mode.
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub partition: u32,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            topic: default_topic(),
            partition: 0,
            probe_timeout_secs: default_probe_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_topic() -> String {
    "prompts".to_string()
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_batch_limit() -> usize {
    10
}

impl Config {
    /// A configuration rooted at `./data`, for commands run without a file.
    pub fn minimal() -> Self {
        Self::rooted_at(Path::new("./data"))
    }

    /// Default configuration with every path under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("cap.sqlite"),
            },
            paths: PathsConfig {
                capture_dir: root.join("captured-images"),
                cleaned_dir: root.join("cleaneddata"),
                prompt_store: root.join("prompt-store"),
            },
            server: ServerConfig::default(),
            cleaning: CleaningConfig::default(),
            analysis: AnalysisConfig::default(),
            ingest: IngestConfig::default(),
            upload: UploadConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate analysis
    if config.analysis.max_segment_chars == 0 {
        anyhow::bail!("analysis.max_segment_chars must be > 0");
    }
    if config.analysis.max_attempts == 0 {
        anyhow::bail!("analysis.max_attempts must be >= 1");
    }
    if config.analysis.timeout_secs == 0 {
        anyhow::bail!("analysis.timeout_secs must be > 0");
    }
    match config.analysis.provider.as_str() {
        "disabled" | "groq" | "openai" => {}
        other => anyhow::bail!(
            "Unknown analysis provider: '{}'. Must be disabled, groq, or openai.",
            other
        ),
    }

    // Validate watchers
    if config.ingest.watch_depth == 0 {
        anyhow::bail!("ingest.watch_depth must be >= 1");
    }
    if config.upload.queue_capacity == 0 {
        anyhow::bail!("upload.queue_capacity must be >= 1");
    }
    for pattern in &config.upload.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("upload.exclude_globs: invalid pattern '{}'", pattern))?;
    }

    // Validate events
    if config.events.batch_limit == 0 {
        anyhow::bail!("events.batch_limit must be >= 1");
    }
    if config.events.poll_interval_secs == 0 {
        anyhow::bail!("events.poll_interval_secs must be >= 1");
    }
    if let Some(url) = &config.events.broker_url {
        url::Url::parse(url).with_context(|| format!("events.broker_url is not a URL: {}", url))?;
    }

    if config.paths.prompt_store == config.paths.cleaned_dir {
        anyhow::bail!("paths.prompt_store and paths.cleaned_dir must differ");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const BASE: &str = r#"
[db]
path = "/tmp/cap.sqlite"

[paths]
capture_dir = "/tmp/cap/raw"
cleaned_dir = "/tmp/cap/cleaned"
prompt_store = "/tmp/cap/prompts"
"#;

    #[test]
    fn test_defaults_applied() {
        let file = write_config(BASE);
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.analysis.max_attempts, 3);
        assert_eq!(cfg.analysis.retry_delay_ms, 1000);
        assert_eq!(cfg.analysis.max_segment_chars, 12_000);
        assert_eq!(cfg.ingest.watch_depth, 2);
        assert_eq!(cfg.upload.watch_depth, 5);
        assert_eq!(cfg.events.topic, "prompts");
        assert_eq!(cfg.events.poll_interval_secs, 5);
        assert_eq!(cfg.events.batch_limit, 10);
        assert!(cfg.events.broker_url.is_none());
        assert_eq!(cfg.paths.lock_dir(), PathBuf::from("/tmp/cap/prompts/.processing"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let file = write_config(&format!("{}\n[analysis]\nprovider = \"nope\"\n", BASE));
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unknown analysis provider"));
    }

    #[test]
    fn test_rejects_bad_broker_url() {
        let file = write_config(&format!("{}\n[events]\nbroker_url = \"not a url\"\n", BASE));
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let file = write_config(&format!("{}\n[events]\nbatch_limit = 0\n", BASE));
        assert!(load_config(file.path()).is_err());
    }
}
