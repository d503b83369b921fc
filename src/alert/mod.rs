//! Alert evaluation and notification delivery.
//!
//! The [`AlertEvaluator`] turns finalized minute snapshots into firing and
//! resolved [`AlertEvent`]s; a [`NotificationSink`] carries them out of the
//! process.

pub mod dingtalk;
mod evaluator;
mod sink;

pub use evaluator::*;
pub use sink::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::metrics::MinuteSnapshot;

/// The health rules evaluated for every engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRule {
    /// Success rate below the minimum for consecutive minutes.
    LowSuccessRate,
    /// Timeout rate above the maximum for consecutive minutes.
    HighTimeoutRate,
    /// Too many 5xx responses within a single minute.
    ServerErrorBurst,
}

impl AlertRule {
    pub fn name(&self) -> &'static str {
        match self {
            AlertRule::LowSuccessRate => "low_success_rate",
            AlertRule::HighTimeoutRate => "high_timeout_rate",
            AlertRule::ServerErrorBurst => "server_error_burst",
        }
    }

    /// Short human-readable title used in notifications.
    pub fn title(&self) -> &'static str {
        match self {
            AlertRule::LowSuccessRate => "success rate alert",
            AlertRule::HighTimeoutRate => "timeout rate alert",
            AlertRule::ServerErrorBurst => "5xx burst alert",
        }
    }

    /// The value of this rule's metric in a snapshot.
    pub fn metric_value(&self, snapshot: &MinuteSnapshot) -> f64 {
        match self {
            AlertRule::LowSuccessRate => snapshot.success_rate,
            AlertRule::HighTimeoutRate => snapshot.timeout_rate,
            AlertRule::ServerErrorBurst => snapshot.server_error as f64,
        }
    }
}

impl fmt::Display for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Firing => f.write_str("firing"),
            AlertStatus::Resolved => f.write_str("resolved"),
        }
    }
}

/// A rule transition for one engine, with the minutes that led to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub engine: String,
    pub rule: AlertRule,
    pub status: AlertStatus,
    /// The rule's metric in `snapshot`.
    pub value: f64,
    pub threshold: f64,
    pub snapshot: MinuteSnapshot,
    /// Recent minutes, oldest first, ending with `snapshot`.
    pub history: Vec<MinuteSnapshot>,
    pub evaluated_at: DateTime<Utc>,
}
