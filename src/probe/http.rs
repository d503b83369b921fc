//! HTTP probe against the SERP proxy API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{Outcome, OutcomeKind, Probe, ProbeError};
use crate::config::{EngineConfig, MonitorConfig};

/// Status line, content type and body size of a completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_type: String,
    pub body_len: u64,
}

impl ProbeResponse {
    /// Classify a completed response.
    pub fn classify(&self) -> OutcomeKind {
        match self.status {
            200..=299 if self.content_type.to_ascii_lowercase().contains("html") => {
                OutcomeKind::InvalidContent(self.status)
            }
            200..=299 => OutcomeKind::Success,
            500..=599 => OutcomeKind::ServerError(self.status),
            status => OutcomeKind::ClientError(status),
        }
    }
}

/// Probes search engines through the SERP proxy with a form-encoded POST.
pub struct SerpProbe {
    client: reqwest::Client,
    api_url: String,
    authorization: String,
    engines: BTreeMap<String, EngineConfig>,
    timeout: Duration,
}

impl SerpProbe {
    pub fn new(config: &MonitorConfig) -> Result<Self, ProbeError> {
        let timeout = config.monitoring.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            authorization: config.auth.authorization.clone(),
            engines: config.search_engines.clone(),
            timeout,
        })
    }

    /// Form fields sent to the proxy for one search.
    pub fn form_params(name: &str, engine: &EngineConfig, term: &str) -> Vec<(String, String)> {
        vec![
            ("engine".to_string(), engine.api_engine(name).to_string()),
            (engine.param.clone(), term.to_string()),
            ("json".to_string(), "1".to_string()),
        ]
    }

    /// The search URL the proxy fetches on our behalf. Used in logs.
    pub fn search_url(engine: &EngineConfig, term: &str) -> String {
        let base = format!("https://{}/search", engine.domain);
        Url::parse_with_params(&base, &[(engine.param.as_str(), term), ("json", "1")])
            .map(|url| url.to_string())
            .unwrap_or(base)
    }

    async fn send(&self, params: &[(String, String)]) -> Result<ProbeResponse, ProbeError> {
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        };

        let response = self
            .client
            .post(&self.api_url)
            .header(AUTHORIZATION, &self.authorization)
            .form(params)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // Read the full body so latency covers the complete transfer
        let body = response.bytes().await.map_err(map_err)?;

        Ok(ProbeResponse {
            status,
            content_type,
            body_len: body.len() as u64,
        })
    }
}

#[async_trait]
impl Probe for SerpProbe {
    async fn probe(
        &self,
        engine: &str,
        term: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<Outcome, ProbeError> {
        let engine_cfg = self
            .engines
            .get(engine)
            .ok_or_else(|| ProbeError::Config(format!("unknown engine: {}", engine)))?;

        let params = Self::form_params(engine, engine_cfg, term);
        let start = Instant::now();
        let result = self.send(&params).await;
        let latency = start.elapsed();

        let outcome = match result {
            Ok(response) => match response.classify() {
                OutcomeKind::Success => {
                    Outcome::success(engine, issued_at, latency, response.body_len)
                }
                kind => Outcome::failure(engine, issued_at, kind, latency),
            },
            Err(ProbeError::Timeout(_)) => {
                Outcome::failure(engine, issued_at, OutcomeKind::Timeout, latency)
            }
            Err(e) => {
                tracing::error!(
                    engine,
                    term,
                    url = %Self::search_url(engine_cfg, term),
                    "Probe request failed after {:.2}s: {}",
                    latency.as_secs_f64(),
                    e
                );
                Outcome::failure(engine, issued_at, OutcomeKind::NetworkError, latency)
            }
        };

        Ok(outcome?)
    }
}
