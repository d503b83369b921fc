//! Configuration module for serpmon.
//!
//! Loads the JSON monitor configuration, applies environment overrides and
//! validates it before anything else sees it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_URL: &str = "https://scraperapi.thordata.com/request";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config format: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("engines not defined in config: {requested} (available: {available})")]
    UnknownEngines { requested: String, available: String },
}

/// A search engine reachable through the proxy API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub domain: String,
    /// Query parameter carrying the search term (`q`, `text`, ...).
    pub param: String,
    /// Engine name sent to the proxy, when it differs from the config key.
    #[serde(default)]
    pub engine: Option<String>,
}

impl EngineConfig {
    pub fn api_engine<'a>(&'a self, name: &'a str) -> &'a str {
        self.engine.as_deref().unwrap_or(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Maximum in-flight probes per engine.
    pub concurrency: usize,
    /// Total request timeout in seconds.
    pub timeout_seconds: f64,
    /// Run length in minutes; absent means run until interrupted.
    #[serde(default)]
    pub monitor_duration_minutes: Option<u64>,
    pub requests_per_engine_per_minute: u32,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl MonitoringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    pub fn monitor_duration(&self) -> Option<Duration> {
        self.monitor_duration_minutes
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    /// Spacing between probes of one engine.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.requests_per_engine_per_minute.max(1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Minimum acceptable success rate (%).
    pub success_rate: f64,
    /// Maximum acceptable timeout rate (%).
    pub timeout_rate: f64,
    /// Requests slower than this many seconds count as timeouts.
    pub timeout_limit: f64,
    pub min_content_size_kb: f64,
    #[serde(default = "default_consecutive_minutes")]
    pub consecutive_minutes: u32,
    #[serde(default = "default_burst_5xx_count")]
    pub burst_5xx_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub authorization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DingTalkConfig {
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default = "default_keyword")]
    pub keyword: String,
    /// Per-request webhook timeout in seconds.
    #[serde(default = "default_notify_timeout")]
    pub timeout_seconds: f64,
}

impl DingTalkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            webhook: None,
            keyword: default_keyword(),
            timeout_seconds: default_notify_timeout(),
        }
    }
}

/// Complete monitor configuration as stored in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub search_engines: BTreeMap<String, EngineConfig>,
    pub search_terms: Vec<String>,
    pub monitoring: MonitoringConfig,
    pub thresholds: ThresholdConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub dingtalk: DingTalkConfig,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// Alerting thresholds in the units the metrics core works with.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub success_rate_min: f64,
    pub timeout_rate_max: f64,
    pub consecutive_minutes: u32,
    pub burst_5xx_count: u32,
    /// Bytes.
    pub min_content_size: u64,
    pub timeout_limit: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            success_rate_min: 95.0,
            timeout_rate_max: 10.0,
            consecutive_minutes: default_consecutive_minutes(),
            burst_5xx_count: default_burst_5xx_count(),
            min_content_size: 2048,
            timeout_limit: Duration::from_secs(10),
        }
    }
}

fn default_history_capacity() -> usize {
    3
}

fn default_consecutive_minutes() -> u32 {
    3
}

fn default_burst_5xx_count() -> u32 {
    3
}

fn default_keyword() -> String {
    "Monitor".to_string()
}

fn default_notify_timeout() -> f64 {
    10.0
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl MonitorConfig {
    /// Load, override from the environment and validate.
    ///
    /// Environment variables:
    /// - `SERPMON_DINGTALK_WEBHOOK`: DingTalk robot webhook URL
    /// - `SERPMON_AUTHORIZATION`: Authorization header for the proxy API
    /// - `SERPMON_API_URL`: proxy API endpoint
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg = Self::from_json(&raw)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(webhook) = env::var("SERPMON_DINGTALK_WEBHOOK") {
            self.dingtalk.webhook = Some(webhook).filter(|w| !w.is_empty());
        }

        if let Ok(authorization) = env::var("SERPMON_AUTHORIZATION") {
            self.auth.authorization = authorization;
        }

        if let Ok(api_url) = env::var("SERPMON_API_URL") {
            self.api_url = api_url;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.search_engines.is_empty() {
            return invalid("at least one search engine must be configured");
        }

        if self.search_engines.keys().any(|name| name.is_empty()) {
            return invalid("search engine names cannot be empty");
        }

        if self.search_terms.is_empty() {
            return invalid("at least one search term must be configured");
        }

        let m = &self.monitoring;
        if m.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if m.requests_per_engine_per_minute == 0 {
            return invalid("requests_per_engine_per_minute must be greater than 0");
        }
        if !(m.timeout_seconds > 0.0 && m.timeout_seconds.is_finite()) {
            return invalid("timeout_seconds must be a positive number");
        }
        if m.history_capacity == 0 {
            return invalid("history_capacity must be greater than 0");
        }

        let t = &self.thresholds;
        for (name, rate) in [("success_rate", t.success_rate), ("timeout_rate", t.timeout_rate)] {
            if !(0.0..=100.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and 100, got {}",
                    name, rate
                )));
            }
        }
        if !(t.timeout_limit > 0.0 && t.timeout_limit.is_finite()) {
            return invalid("timeout_limit must be a positive number");
        }
        if t.min_content_size_kb < 0.0 {
            return invalid("min_content_size_kb cannot be negative");
        }
        if t.consecutive_minutes == 0 {
            return invalid("consecutive_minutes must be greater than 0");
        }
        if t.burst_5xx_count == 0 {
            return invalid("burst_5xx_count must be greater than 0");
        }
        if m.history_capacity < t.consecutive_minutes as usize {
            return Err(ConfigError::Invalid(format!(
                "history_capacity ({}) must cover consecutive_minutes ({})",
                m.history_capacity, t.consecutive_minutes
            )));
        }

        let d = &self.dingtalk;
        if !(d.timeout_seconds > 0.0 && d.timeout_seconds.is_finite()) {
            return invalid("dingtalk.timeout_seconds must be a positive number");
        }

        if self.api_url.is_empty() {
            return invalid("api_url cannot be empty");
        }

        Ok(())
    }

    /// Keep only the named engines.
    pub fn retain_engines(&mut self, names: &[String]) -> Result<(), ConfigError> {
        let unknown: Vec<&str> = names
            .iter()
            .filter(|n| !self.search_engines.contains_key(n.as_str()))
            .map(String::as_str)
            .collect();

        if !unknown.is_empty() {
            return Err(ConfigError::UnknownEngines {
                requested: unknown.join(", "),
                available: self
                    .search_engines
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        self.search_engines.retain(|name, _| names.contains(name));
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        let t = &self.thresholds;
        Thresholds {
            success_rate_min: t.success_rate,
            timeout_rate_max: t.timeout_rate,
            consecutive_minutes: t.consecutive_minutes,
            burst_5xx_count: t.burst_5xx_count,
            min_content_size: (t.min_content_size_kb * 1024.0).round() as u64,
            timeout_limit: Duration::from_secs_f64(t.timeout_limit),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> MonitorConfig {
    MonitorConfig::from_json(SAMPLE).expect("sample config parses")
}

#[cfg(test)]
const SAMPLE: &str = r#"{
    "search_engines": {
        "google": {"domain": "www.google.com", "param": "q"},
        "yandex": {"domain": "yandex.com", "param": "text", "engine": "yandex_search"}
    },
    "search_terms": ["Apple", "Bread", "Cheese"],
    "monitoring": {
        "concurrency": 5,
        "timeout_seconds": 20,
        "requests_per_engine_per_minute": 5
    },
    "thresholds": {
        "success_rate": 95,
        "timeout_rate": 10,
        "timeout_limit": 10,
        "min_content_size_kb": 2
    },
    "auth": {"authorization": "Bearer token", "content_type": "application/json"}
}"#;
