//! Configuration: a single TOML file loaded once at startup, via
//! `serde` + `toml`, since this crate has a real shaped config surface:
//! site rules, concurrency limits, LLM budget.

use crate::error::ConfigError;
use crate::model::SiteRule;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

fn default_http_addr() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_db_path() -> String {
    "price-monitor.sqlite".to_string()
}
fn default_max_concurrency() -> usize {
    8
}
fn default_per_domain_concurrency() -> usize {
    2
}
fn default_requests_per_second_per_domain() -> f64 {
    1.0
}
fn default_fetch_timeout_ms() -> u64 {
    15_000
}
fn default_render_timeout_ms() -> u64 {
    20_000
}
fn default_llm_batch_budget_usd() -> Decimal {
    Decimal::new(500, 2) // 5.00
}
fn default_event_bus_capacity() -> usize {
    1024
}
fn default_llm_timeout_ms() -> u64 {
    30_000
}
fn default_llm_max_payload_chars() -> usize {
    6_000
}
fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_llm_api_key_ref() -> String {
    "PRICE_MONITOR_LLM_API_KEY".to_string()
}

/// Vendor LLM settings (spec.md §6.4, §4.5). `api_key_ref` names an
/// environment variable read at startup rather than embedding a secret
/// in the config file directly.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub vendor_id: String,
    pub model: String,
    #[serde(default = "default_llm_api_key_ref")]
    pub api_key_ref: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    pub cost_per_1m_prompt: Decimal,
    pub cost_per_1m_completion: Decimal,
    #[serde(default = "default_llm_max_payload_chars")]
    pub max_payload_chars: usize,
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            vendor_id: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_ref: default_llm_api_key_ref(),
            endpoint: default_llm_endpoint(),
            cost_per_1m_prompt: Decimal::new(150, 2),
            cost_per_1m_completion: Decimal::new(600, 2),
            max_payload_chars: default_llm_max_payload_chars(),
            llm_timeout_ms: default_llm_timeout_ms(),
        }
    }
}

/// Top-level application configuration, deserialized from
/// `price-monitor.toml` (or a path given on the command line).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Total number of machines extracted concurrently across the
    /// whole process.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum concurrent requests to a single domain, regardless of
    /// global concurrency headroom. Keeps us a polite crawler.
    #[serde(default = "default_per_domain_concurrency")]
    pub per_domain_concurrency: usize,

    /// Token-bucket refill rate per domain.
    #[serde(default = "default_requests_per_second_per_domain")]
    pub requests_per_second_per_domain: f64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_render_timeout_ms")]
    pub render_timeout_ms: u64,

    /// Hard ceiling on LLM spend for a single batch run. Extractions
    /// that would exceed it fall through to `Tier::Manual` instead.
    #[serde(default = "default_llm_batch_budget_usd")]
    pub llm_batch_budget_usd: Decimal,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Per-domain extraction rules. Order does not matter; the table is
    /// keyed by domain at load time.
    #[serde(default)]
    pub site_rules: Vec<SiteRule>,

    /// Vendor LLM settings for the last-resort extraction tier. Absent
    /// entirely disables the LLM tier (the orchestrator treats `None`
    /// the same way it treats a renderer-less dynamic tier: skipped).
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            db_path: default_db_path(),
            max_concurrency: default_max_concurrency(),
            per_domain_concurrency: default_per_domain_concurrency(),
            requests_per_second_per_domain: default_requests_per_second_per_domain(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            render_timeout_ms: default_render_timeout_ms(),
            llm_batch_budget_usd: default_llm_batch_budget_usd(),
            event_bus_capacity: default_event_bus_capacity(),
            site_rules: Vec::new(),
            llm: None,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse from an in-memory TOML string (used by tests and by
    /// `load`).
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.per_domain_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "per_domain_concurrency must be at least 1".into(),
            ));
        }
        if self.requests_per_second_per_domain <= 0.0 {
            return Err(ConfigError::Invalid(
                "requests_per_second_per_domain must be positive".into(),
            ));
        }
        Ok(())
    }
}
