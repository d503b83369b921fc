//! Typed result of a single probe.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::metrics::minute_epoch;

/// Classification of one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Timeout,
    ServerError(u16),
    ClientError(u16),
    NetworkError,
    /// 2xx response whose payload failed validation (e.g. an HTML page).
    InvalidContent(u16),
}

impl OutcomeKind {
    fn validate_status(&self) -> Result<(), OutcomeError> {
        let (status, ok, kind) = match *self {
            OutcomeKind::ServerError(s) => (s, (500..=599).contains(&s), "server error"),
            OutcomeKind::ClientError(s) => {
                (s, (100..=999).contains(&s) && !(200..=299).contains(&s) && !(500..=599).contains(&s), "client error")
            }
            OutcomeKind::InvalidContent(s) => (s, (200..=299).contains(&s), "invalid content"),
            _ => return Ok(()),
        };

        if ok {
            Ok(())
        } else {
            Err(OutcomeError::InvalidStatus { status, kind })
        }
    }
}

/// Contract violations when building an [`Outcome`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OutcomeError {
    #[error("engine identifier cannot be empty")]
    EmptyEngine,
    #[error("success outcome for {0} is missing a payload size")]
    MissingPayload(String),
    #[error("{kind:?} outcome for {engine} must not carry a payload size")]
    UnexpectedPayload { engine: String, kind: OutcomeKind },
    #[error("status {status} is not valid for a {kind} outcome")]
    InvalidStatus { status: u16, kind: &'static str },
}

/// One probe result. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    engine: String,
    timestamp: DateTime<Utc>,
    kind: OutcomeKind,
    latency: Duration,
    payload_size: Option<u64>,
}

impl Outcome {
    /// Build an outcome, rejecting kind/payload combinations that cannot occur.
    ///
    /// `timestamp` is the time the probe was issued; it decides which minute
    /// window the outcome is counted in.
    pub fn new(
        engine: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: OutcomeKind,
        latency: Duration,
        payload_size: Option<u64>,
    ) -> Result<Self, OutcomeError> {
        let engine = engine.into();
        if engine.is_empty() {
            return Err(OutcomeError::EmptyEngine);
        }

        kind.validate_status()?;

        match (kind, payload_size) {
            (OutcomeKind::Success, None) => return Err(OutcomeError::MissingPayload(engine)),
            (OutcomeKind::Success, Some(_)) | (_, None) => {}
            (kind, Some(_)) => return Err(OutcomeError::UnexpectedPayload { engine, kind }),
        }

        Ok(Self {
            engine,
            timestamp,
            kind,
            latency,
            payload_size,
        })
    }

    pub fn success(
        engine: impl Into<String>,
        timestamp: DateTime<Utc>,
        latency: Duration,
        payload_size: u64,
    ) -> Result<Self, OutcomeError> {
        Self::new(engine, timestamp, OutcomeKind::Success, latency, Some(payload_size))
    }

    pub fn failure(
        engine: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: OutcomeKind,
        latency: Duration,
    ) -> Result<Self, OutcomeError> {
        Self::new(engine, timestamp, kind, latency, None)
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> OutcomeKind {
        self.kind
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn payload_size(&self) -> Option<u64> {
        self.payload_size
    }

    /// Minute epoch of the issuance timestamp.
    pub fn minute(&self) -> i64 {
        minute_epoch(self.timestamp)
    }
}
