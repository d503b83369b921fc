//! Probe module for search-engine proxy monitoring.
//!
//! A probe issues one search through the proxy API and classifies the result
//! as an [`Outcome`].

mod http;
mod outcome;

pub use http::*;
pub use outcome::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
}

/// Executes a single probe.
///
/// Transport failures are not errors: they come back as failed [`Outcome`]s.
/// `Err` is reserved for misconfiguration.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(
        &self,
        engine: &str,
        term: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<Outcome, ProbeError>;
}
