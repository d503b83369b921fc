//! DingTalk robot webhook delivery.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use super::{AlertEvent, AlertRule, AlertStatus};
use crate::metrics::MinuteSnapshot;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned HTTP {0}")]
    Status(u16),
    #[error("webhook rejected message: errcode={code} errmsg={message}")]
    Rejected { code: i64, message: String },
}

#[derive(Debug, Deserialize)]
struct DingTalkResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

pub struct DingTalkNotifier {
    client: reqwest::Client,
    webhook_url: String,
    keyword: String,
}

impl DingTalkNotifier {
    /// `timeout` bounds each webhook request, connect through body.
    pub fn new(webhook_url: &str, keyword: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            webhook_url: webhook_url.to_string(),
            keyword: keyword.to_string(),
        })
    }

    /// Markdown title and body for an event.
    ///
    /// DingTalk robots with keyword security drop messages that do not
    /// contain the keyword, so it leads both parts.
    pub fn format_markdown(&self, event: &AlertEvent) -> (String, String) {
        let engine = event.engine.to_uppercase();
        let tag = match event.status {
            AlertStatus::Firing => "",
            AlertStatus::Resolved => " [RESOLVED]",
        };

        let title = format!(
            "{} | {} {}{} | {}_{}",
            self.keyword,
            engine,
            event.rule.title(),
            tag,
            engine,
            event.evaluated_at.format("%H:%M:%S")
        );

        let recent = event
            .history
            .iter()
            .map(|s| format_metric(event.rule, s))
            .collect::<Vec<_>>()
            .join(", ");

        let text = format!(
            "### SERP_{} | {} {}{}\n\n{}\n\nLast {} minutes {}: {}",
            self.keyword,
            engine,
            event.rule.title(),
            tag,
            describe(event),
            event.history.len(),
            metric_label(event.rule),
            recent
        );

        (title, text)
    }

    pub fn payload(&self, event: &AlertEvent) -> Value {
        let (title, text) = self.format_markdown(event);
        json!({
            "msgtype": "markdown",
            "markdown": {
                "title": title,
                "text": text,
            }
        })
    }

    /// Post one event. No retries.
    pub async fn send(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&self.payload(event))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        if let Ok(reply) = serde_json::from_str::<DingTalkResponse>(&body) {
            if reply.errcode != 0 {
                return Err(NotifyError::Rejected {
                    code: reply.errcode,
                    message: reply.errmsg,
                });
            }
        }

        Ok(())
    }
}

fn metric_label(rule: AlertRule) -> &'static str {
    match rule {
        AlertRule::LowSuccessRate => "success rate",
        AlertRule::HighTimeoutRate => "timeout rate",
        AlertRule::ServerErrorBurst => "5xx count",
    }
}

fn format_metric(rule: AlertRule, snapshot: &MinuteSnapshot) -> String {
    if !snapshot.has_traffic() {
        return "-".to_string();
    }
    match rule {
        AlertRule::ServerErrorBurst => snapshot.server_error.to_string(),
        _ => format!("{:.2}%", rule.metric_value(snapshot)),
    }
}

/// Minutes in the event history that broke the rule. Zero-traffic minutes
/// never count.
fn violating_minutes(event: &AlertEvent) -> usize {
    event
        .history
        .iter()
        .filter(|s| s.has_traffic())
        .filter(|s| match event.rule {
            AlertRule::LowSuccessRate => s.success_rate < event.threshold,
            AlertRule::HighTimeoutRate => s.timeout_rate > event.threshold,
            AlertRule::ServerErrorBurst => s.server_error as f64 >= event.threshold,
        })
        .count()
}

fn describe(event: &AlertEvent) -> String {
    let minutes = event.history.len();
    match (event.rule, event.status) {
        (AlertRule::LowSuccessRate, AlertStatus::Firing) => format!(
            "Success rate below {}% in {} of the last {} minutes",
            event.threshold,
            violating_minutes(event),
            minutes
        ),
        (AlertRule::HighTimeoutRate, AlertStatus::Firing) => format!(
            "Timeout rate above {}% in {} of the last {} minutes",
            event.threshold,
            violating_minutes(event),
            minutes
        ),
        (AlertRule::LowSuccessRate, AlertStatus::Resolved) => format!(
            "Success rate recovered to {:.2}% (threshold {}%)",
            event.value, event.threshold
        ),
        (AlertRule::HighTimeoutRate, AlertStatus::Resolved) => format!(
            "Timeout rate recovered to {:.2}% (threshold {}%)",
            event.value, event.threshold
        ),
        (AlertRule::ServerErrorBurst, _) => format!(
            "{} server errors (5xx) within minute {}, threshold {}",
            event.snapshot.server_error,
            event.snapshot.started_at.format("%H:%M"),
            event.threshold
        ),
    }
}
