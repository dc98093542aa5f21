//! Application configuration structures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Directory holding one state file per pipeline
    #[serde(default = "defaults::state_dir")]
    pub state_dir: PathBuf,

    /// How long a shutdown waits for in-flight ticks to finish
    #[serde(default = "defaults::drain_seconds")]
    pub drain_seconds: u64,

    /// Pipeline definitions
    #[serde(default)]
    pub pipelines: Vec<PipelineDef>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        self.http.validate()?;

        if self.pipelines.is_empty() {
            return Err(AppError::config("no pipelines defined"));
        }

        let mut seen = std::collections::HashSet::new();
        for def in &self.pipelines {
            def.validate()?;
            if !seen.insert(def.id.as_str()) {
                return Err(AppError::config(format!(
                    "duplicate pipeline id '{}'",
                    def.id
                )));
            }
        }
        Ok(())
    }

    /// Look up a pipeline by id.
    pub fn pipeline(&self, id: &str) -> Option<&PipelineDef> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    /// Shutdown drain window.
    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            state_dir: defaults::state_dir(),
            drain_seconds: defaults::drain_seconds(),
            pipelines: Vec::new(),
        }
    }
}

/// Shared HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for all outbound requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Total concurrent outbound sockets
    #[serde(default = "defaults::max_sockets")]
    pub max_sockets: usize,

    /// Concurrent requests allowed per upstream host
    #[serde(default = "defaults::per_host_concurrency")]
    pub per_host_concurrency: usize,
}

impl HttpConfig {
    fn validate(&self) -> Result<()> {
        if self.user_agent.trim().is_empty() {
            return Err(AppError::config("http.user_agent is empty"));
        }
        if self.timeout_secs == 0 {
            return Err(AppError::config("http.timeout_secs must be > 0"));
        }
        if self.max_sockets == 0 {
            return Err(AppError::config("http.max_sockets must be > 0"));
        }
        if self.per_host_concurrency == 0 {
            return Err(AppError::config("http.per_host_concurrency must be > 0"));
        }
        Ok(())
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            max_sockets: defaults::max_sockets(),
            per_host_concurrency: defaults::per_host_concurrency(),
        }
    }
}

/// Immutable configuration for one alerting pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Stable id, unique per process; doubles as the state file name
    pub id: String,

    /// Display label for message headers (defaults to the id)
    #[serde(default)]
    pub label: Option<String>,

    /// Seconds between ticks
    pub interval_seconds: u64,

    /// Where and how to fetch rows
    pub source: SourceSpec,

    /// Filtering and scoring rule
    #[serde(default)]
    pub rule: RuleSpec,

    /// Ordered, non-empty list of chat destinations
    #[serde(default)]
    pub destinations: Vec<Destination>,

    /// Minimum seconds between two alerts for the same key
    /// (defaults to the tick interval)
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,

    /// Maximum snapshot size
    #[serde(default = "defaults::top_k")]
    pub top_k: usize,

    /// Message template: "compact" or "detailed"
    #[serde(default = "defaults::template")]
    pub template: String,

    /// Alert when a key's score falls past the tolerance
    #[serde(default)]
    pub emit_fallen: bool,

    /// Alert when a key leaves the snapshot
    #[serde(default)]
    pub emit_dropped: bool,

    /// Absolute score tolerance; unset means relative 1e-9 · |score|
    #[serde(default)]
    pub score_epsilon: Option<f64>,

    /// Accept an empty fetch even when the previous snapshot had rows
    #[serde(default)]
    pub allow_empty_snapshot: bool,

    /// Token-bucket rate limit for this pipeline's upstream host
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,

    /// Hard ceiling for one tick, fetch and delivery included
    #[serde(default = "defaults::tick_timeout")]
    pub tick_timeout_seconds: u64,
}

impl PipelineDef {
    /// Tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Cool-down window, defaulting to the tick interval.
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_seconds.unwrap_or(self.interval_seconds) as i64)
    }

    /// Per-tick hard timeout.
    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_seconds)
    }

    /// Header label for rendered messages.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::config("pipeline id is empty"));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(AppError::config(format!(
                "pipeline id '{}' may only contain [A-Za-z0-9._-]",
                self.id
            )));
        }
        if self.interval_seconds == 0 {
            return Err(AppError::config(format!(
                "pipeline '{}': interval_seconds must be >= 1",
                self.id
            )));
        }
        if self.destinations.is_empty() {
            return Err(AppError::config(format!(
                "pipeline '{}': at least one destination is required",
                self.id
            )));
        }
        if self.top_k == 0 {
            return Err(AppError::config(format!(
                "pipeline '{}': top_k must be >= 1",
                self.id
            )));
        }
        if !matches!(self.template.as_str(), "compact" | "detailed") {
            return Err(AppError::config(format!(
                "pipeline '{}': unknown template '{}'",
                self.id, self.template
            )));
        }
        if self.tick_timeout_seconds == 0 {
            return Err(AppError::config(format!(
                "pipeline '{}': tick_timeout_seconds must be >= 1",
                self.id
            )));
        }
        if let Some(eps) = self.score_epsilon {
            if !eps.is_finite() || eps < 0.0 {
                return Err(AppError::config(format!(
                    "pipeline '{}': score_epsilon must be finite and >= 0",
                    self.id
                )));
            }
        }
        self.source.validate(&self.id)?;
        self.rule.validate(&self.id)?;
        Ok(())
    }
}

/// Where one pipeline fetches its rows from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// JSON API endpoint
    HttpJson {
        url: String,

        /// Extra query parameters appended to the URL
        #[serde(default)]
        query: BTreeMap<String, String>,

        /// Dot-path from the response root to the row array
        /// (empty = the root itself is the array)
        #[serde(default)]
        path_to_rows: String,

        field_map: FieldMap,
    },

    /// HTML page scraped with CSS selectors
    HttpHtml {
        url: String,

        /// Selector matching one element per row
        row_selector: String,

        field_selectors: FieldSelectors,
    },
}

impl SourceSpec {
    /// The endpoint URL as configured.
    pub fn url(&self) -> &str {
        match self {
            Self::HttpJson { url, .. } | Self::HttpHtml { url, .. } => url,
        }
    }

    fn validate(&self, pipeline_id: &str) -> Result<()> {
        let url = self.url();
        Url::parse(url).map_err(|e| {
            AppError::config(format!("pipeline '{pipeline_id}': bad source url: {e}"))
        })?;

        if let Self::HttpJson { field_map, .. } = self {
            if field_map.key.trim().is_empty() {
                return Err(AppError::config(format!(
                    "pipeline '{pipeline_id}': field_map.key is empty"
                )));
            }
        }
        if let Self::HttpHtml {
            row_selector,
            field_selectors,
            ..
        } = self
        {
            if row_selector.trim().is_empty() {
                return Err(AppError::config(format!(
                    "pipeline '{pipeline_id}': row_selector is empty"
                )));
            }
            if field_selectors.key.trim().is_empty() {
                return Err(AppError::config(format!(
                    "pipeline '{pipeline_id}': field_selectors.key is empty"
                )));
            }
        }
        Ok(())
    }
}

/// Projection from JSON row fields to record fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    /// Dot-path to the identity field
    pub key: String,

    /// Dot-path to the numeric score (rows without it score 0)
    #[serde(default)]
    pub score: Option<String>,

    /// Dot-path to the display label (defaults to the key)
    #[serde(default)]
    pub label: Option<String>,

    /// Template-visible attributes, in display order
    #[serde(default)]
    pub attributes: Vec<AttrPath>,

    /// Canonicalise the key to uppercase (market symbols)
    #[serde(default)]
    pub uppercase_key: bool,
}

/// One named attribute extracted by dot-path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrPath {
    pub name: String,
    pub path: String,
}

/// Projection from HTML row elements to record fields.
///
/// Each selector is CSS with an optional `@attr` suffix to read an element
/// attribute instead of its text content (e.g. `a.title@href`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSelectors {
    /// Selector for the identity field
    pub key: String,

    /// Selector for the numeric score (rows without it score 0)
    #[serde(default)]
    pub score: Option<String>,

    /// Selector for the display label (defaults to the key)
    #[serde(default)]
    pub label: Option<String>,

    /// Template-visible attributes, in display order
    #[serde(default)]
    pub attributes: Vec<AttrSelector>,
}

/// One named attribute extracted by CSS selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrSelector {
    pub name: String,
    pub selector: String,
}

/// Filtering and scoring rule for one pipeline.
///
/// A row survives when it passes every configured predicate; surviving rows
/// are sorted by score descending, ties broken by fetch time then key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Keep rows with score >= this value
    #[serde(default)]
    pub min_score: Option<f64>,

    /// Keep rows with score <= this value
    #[serde(default)]
    pub max_score: Option<f64>,

    /// Keep rows that carry all of these attributes, non-empty
    #[serde(default)]
    pub require_attributes: Vec<String>,

    /// Multiply surviving scores by this factor
    #[serde(default)]
    pub score_scale: Option<f64>,

    /// Keep rows scoring at least `ratio` times a reference row's score
    #[serde(default)]
    pub reference: Option<ReferenceRule>,
}

impl RuleSpec {
    fn validate(&self, pipeline_id: &str) -> Result<()> {
        for v in [self.min_score, self.max_score, self.score_scale] {
            if let Some(v) = v {
                if !v.is_finite() {
                    return Err(AppError::config(format!(
                        "pipeline '{pipeline_id}': rule thresholds must be finite"
                    )));
                }
            }
        }
        if let Some(r) = &self.reference {
            if r.key.trim().is_empty() {
                return Err(AppError::config(format!(
                    "pipeline '{pipeline_id}': reference.key is empty"
                )));
            }
            if !r.ratio.is_finite() {
                return Err(AppError::config(format!(
                    "pipeline '{pipeline_id}': reference.ratio must be finite"
                )));
            }
        }
        Ok(())
    }
}

/// Cross-row constraint: keep rows scoring at least `ratio · score_of(key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub key: String,
    pub ratio: f64,
}

/// A chat endpoint: kind + credentials + channel id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    /// Telegram bot API `sendMessage`
    Telegram { token: String, chat_id: String },

    /// Discord webhook: chat_id is the webhook id, token its secret
    Discord { token: String, chat_id: String },

    /// Slack incoming webhook: token is the `T.../B.../...` path
    Slack {
        token: String,
        #[serde(default)]
        chat_id: String,
    },
}

impl Destination {
    /// Destination kind name for logs and reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Telegram { .. } => "telegram",
            Self::Discord { .. } => "discord",
            Self::Slack { .. } => "slack",
        }
    }

    /// Log-safe description; never includes the token.
    pub fn describe(&self) -> String {
        match self {
            Self::Telegram { chat_id, .. } => format!("telegram:{chat_id}"),
            Self::Discord { chat_id, .. } => format!("discord:{chat_id}"),
            Self::Slack { chat_id, .. } if !chat_id.is_empty() => format!("slack:{chat_id}"),
            Self::Slack { .. } => "slack".to_string(),
        }
    }
}

/// Default values used by serde.
mod defaults {
    use std::path::PathBuf;

    pub fn state_dir() -> PathBuf {
        PathBuf::from("state")
    }

    pub fn drain_seconds() -> u64 {
        30
    }

    pub fn user_agent() -> String {
        format!("herald/{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn timeout() -> u64 {
        30
    }

    pub fn max_sockets() -> usize {
        16
    }

    pub fn per_host_concurrency() -> usize {
        4
    }

    pub fn top_k() -> usize {
        10
    }

    pub fn template() -> String {
        "compact".to_string()
    }

    pub fn tick_timeout() -> u64 {
        60
    }
}
