//! Consecutive-violation state machine.

use chrono::Utc;
use std::collections::HashMap;

use super::{AlertEvent, AlertRule, AlertStatus};
use crate::config::Thresholds;
use crate::metrics::{HistoryRing, MinuteSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleStatus {
    #[default]
    Normal,
    Alerting,
}

/// Streak state of one (engine, rule) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleState {
    pub consecutive: u32,
    pub status: RuleStatus,
}

/// Key: (engine, rule)
type StateKey = (String, AlertRule);

/// Evaluates finalized minutes against the thresholds.
///
/// The success-rate and timeout-rate rules latch: they fire once when the
/// violation streak reaches `consecutive_minutes` and resolve on the first
/// clean minute with traffic. Minutes without traffic leave the streak alone.
/// The 5xx burst rule is judged per minute and never resolves.
pub struct AlertEvaluator {
    thresholds: Thresholds,
    states: HashMap<StateKey, RuleState>,
}

impl AlertEvaluator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, engine: &str, rule: AlertRule) -> Option<RuleState> {
        self.states.get(&(engine.to_string(), rule)).copied()
    }

    /// Evaluate one finalized minute. `history` must already contain `snapshot`.
    pub fn evaluate(
        &mut self,
        engine: &str,
        snapshot: &MinuteSnapshot,
        history: &HistoryRing,
    ) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for rule in [AlertRule::LowSuccessRate, AlertRule::HighTimeoutRate] {
            if let Some(status) = self.advance_streak(engine, rule, snapshot) {
                events.push(self.build_event(engine, rule, status, snapshot, history));
            }
        }

        if snapshot.server_error >= u64::from(self.thresholds.burst_5xx_count) {
            tracing::warn!(
                engine,
                server_errors = snapshot.server_error,
                "{} 5xx responses within minute {}",
                snapshot.server_error,
                snapshot.started_at.format("%H:%M")
            );
            events.push(self.build_event(
                engine,
                AlertRule::ServerErrorBurst,
                AlertStatus::Firing,
                snapshot,
                history,
            ));
        }

        events
    }

    /// `None` when the minute had no traffic and cannot be judged.
    fn violates(&self, rule: AlertRule, snapshot: &MinuteSnapshot) -> Option<bool> {
        if !snapshot.has_traffic() {
            return None;
        }

        let violated = match rule {
            AlertRule::LowSuccessRate => snapshot.success_rate < self.thresholds.success_rate_min,
            AlertRule::HighTimeoutRate => snapshot.timeout_rate > self.thresholds.timeout_rate_max,
            AlertRule::ServerErrorBurst => return None,
        };
        Some(violated)
    }

    fn advance_streak(
        &mut self,
        engine: &str,
        rule: AlertRule,
        snapshot: &MinuteSnapshot,
    ) -> Option<AlertStatus> {
        let violated = self.violates(rule, snapshot);
        let required = self.thresholds.consecutive_minutes;
        let state = self.states.entry((engine.to_string(), rule)).or_default();

        let Some(violated) = violated else {
            tracing::debug!(engine, %rule, streak = state.consecutive, "No traffic, streak unchanged");
            return None;
        };

        if violated {
            state.consecutive = state.consecutive.saturating_add(1);
            if state.status == RuleStatus::Normal && state.consecutive >= required {
                state.status = RuleStatus::Alerting;
                return Some(AlertStatus::Firing);
            }
            tracing::debug!(engine, %rule, streak = state.consecutive, "Violation streak");
            None
        } else {
            state.consecutive = 0;
            if state.status == RuleStatus::Alerting {
                state.status = RuleStatus::Normal;
                return Some(AlertStatus::Resolved);
            }
            None
        }
    }

    fn build_event(
        &self,
        engine: &str,
        rule: AlertRule,
        status: AlertStatus,
        snapshot: &MinuteSnapshot,
        history: &HistoryRing,
    ) -> AlertEvent {
        let threshold = match rule {
            AlertRule::LowSuccessRate => self.thresholds.success_rate_min,
            AlertRule::HighTimeoutRate => self.thresholds.timeout_rate_max,
            AlertRule::ServerErrorBurst => f64::from(self.thresholds.burst_5xx_count),
        };

        AlertEvent {
            engine: engine.to_string(),
            rule,
            status,
            value: rule.metric_value(snapshot),
            threshold,
            snapshot: snapshot.clone(),
            history: history
                .last(self.thresholds.consecutive_minutes as usize)
                .into_iter()
                .cloned()
                .collect(),
            evaluated_at: Utc::now(),
        }
    }
}
