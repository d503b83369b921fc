//! Monitor core: folds outcomes into minute windows and rolls them over.
//!
//! The host drives it through two calls: [`Monitor::record`] for every
//! completed probe and [`Monitor::tick`] whenever a minute may be closed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::alert::{AlertEvaluator, AlertEvent, AlertRule, NotificationSink, RuleState, RuleStatus};
use crate::config::{MonitorConfig, Thresholds};
use crate::metrics::{Bucket, HistoryRing, MinuteSnapshot, MinuteWindow};
use crate::probe::Outcome;

/// What happened to a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Folded(Bucket),
    /// The outcome's minute was already finalized; it was dropped.
    Late,
}

/// Rollover state of one engine.
struct EngineState {
    /// Windows still accepting outcomes, keyed by minute epoch.
    open: BTreeMap<i64, MinuteWindow>,
    last_finalized: Option<i64>,
    history: HistoryRing,
}

impl EngineState {
    fn new(history_capacity: usize) -> Self {
        Self {
            open: BTreeMap::new(),
            last_finalized: None,
            history: HistoryRing::new(history_capacity),
        }
    }

    /// First minute the next rollover must finalize, or `None` if `minute`
    /// has already been finalized.
    fn next_minute(&self, minute: i64) -> Option<i64> {
        match self.last_finalized {
            Some(last) if last >= minute => None,
            Some(last) => Some(last + 1),
            None => Some(
                self.open
                    .keys()
                    .next()
                    .map_or(minute, |&first| first.min(minute)),
            ),
        }
    }
}

pub struct Monitor {
    thresholds: Thresholds,
    history_capacity: usize,
    engines: BTreeMap<String, EngineState>,
    evaluator: AlertEvaluator,
    sink: Arc<dyn NotificationSink>,
    late_outcomes: u64,
}

impl Monitor {
    pub fn new(
        thresholds: Thresholds,
        history_capacity: usize,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            evaluator: AlertEvaluator::new(thresholds.clone()),
            thresholds,
            history_capacity,
            engines: BTreeMap::new(),
            sink,
            late_outcomes: 0,
        }
    }

    /// Build a monitor with every configured engine registered, so engines
    /// that never answer still get (empty) minutes.
    pub fn from_config(config: &MonitorConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let mut monitor = Self::new(
            config.thresholds(),
            config.monitoring.history_capacity,
            sink,
        );
        for engine in config.search_engines.keys() {
            monitor.register_engine(engine);
        }
        monitor
    }

    pub fn register_engine(&mut self, engine: &str) {
        if !self.engines.contains_key(engine) {
            self.engines
                .insert(engine.to_string(), EngineState::new(self.history_capacity));
        }
    }

    /// Fold an outcome into the window of its engine and issuance minute.
    pub fn record(&mut self, outcome: &Outcome) -> RecordStatus {
        self.register_engine(outcome.engine());
        let minute = outcome.minute();

        let Some(state) = self.engines.get_mut(outcome.engine()) else {
            return RecordStatus::Late;
        };

        if state.last_finalized.is_some_and(|last| minute <= last) {
            self.late_outcomes += 1;
            tracing::warn!(
                engine = outcome.engine(),
                minute,
                issued_at = %outcome.timestamp(),
                "Dropping outcome issued in an already finalized minute ({} late so far)",
                self.late_outcomes
            );
            return RecordStatus::Late;
        }

        let bucket = state
            .open
            .entry(minute)
            .or_default()
            .record(outcome, &self.thresholds);
        RecordStatus::Folded(bucket)
    }

    /// Finalize every minute up to and including `minute` for every engine.
    ///
    /// Skipped minutes are finalized as zero-traffic windows. Minutes that
    /// were already finalized are never evaluated again, so a repeated tick
    /// is a no-op.
    pub fn tick(&mut self, minute: i64) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for (engine, state) in self.engines.iter_mut() {
            let Some(first) = state.next_minute(minute) else {
                continue;
            };

            for m in first..=minute {
                let snapshot = state.open.remove(&m).unwrap_or_default().finalize(m);
                log_summary(engine, &snapshot);

                state.history.push(snapshot.clone());
                state.last_finalized = Some(m);
                events.extend(self.evaluator.evaluate(engine, &snapshot, &state.history));
            }
        }

        for event in &events {
            self.deliver(event);
        }

        events
    }

    fn deliver(&self, event: &AlertEvent) {
        tracing::warn!(
            engine = %event.engine,
            rule = %event.rule,
            status = %event.status,
            value = event.value,
            threshold = event.threshold,
            "Alert {}",
            event.status
        );

        if let Err(e) = self.sink.notify(event) {
            tracing::error!(
                "Monitor: failed to hand {} {} for {} to {} sink: {}",
                event.rule,
                event.status,
                event.engine,
                self.sink.name(),
                e
            );
        }
    }

    pub fn history(&self, engine: &str) -> Option<&HistoryRing> {
        self.engines.get(engine).map(|s| &s.history)
    }

    pub fn last_finalized(&self, engine: &str) -> Option<i64> {
        self.engines.get(engine).and_then(|s| s.last_finalized)
    }

    pub fn rule_state(&self, engine: &str, rule: AlertRule) -> Option<RuleState> {
        self.evaluator.state(engine, rule)
    }

    pub fn late_outcomes(&self) -> u64 {
        self.late_outcomes
    }

    /// One log line per engine with its last finalized minute and any rule
    /// still alerting. Returns the (engine, rule) pairs still alerting.
    pub fn log_final_state(&self) -> Vec<(String, AlertRule)> {
        let mut alerting = Vec::new();

        for engine in self.engines.keys() {
            let Some(history) = self.history(engine) else {
                continue;
            };
            if history.is_empty() {
                tracing::info!(engine = %engine, "No minutes finalized");
                continue;
            }

            let open_rules: Vec<AlertRule> = [AlertRule::LowSuccessRate, AlertRule::HighTimeoutRate]
                .into_iter()
                .filter(|&rule| {
                    self.rule_state(engine, rule)
                        .is_some_and(|s| s.status == RuleStatus::Alerting)
                })
                .collect();

            if let Some(latest) = history.latest() {
                tracing::info!(
                    engine = %engine,
                    last_finalized = ?self.last_finalized(engine),
                    retained = history.len(),
                    "Final minute {}: success {:.2}% | timeout {:.2}% | still alerting: {}",
                    latest.started_at.format("%H:%M"),
                    latest.success_rate,
                    latest.timeout_rate,
                    if open_rules.is_empty() {
                        "none".to_string()
                    } else {
                        open_rules.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
                    }
                );
            }

            alerting.extend(open_rules.into_iter().map(|rule| (engine.clone(), rule)));
        }

        alerting
    }
}

fn log_summary(engine: &str, snapshot: &MinuteSnapshot) {
    if !snapshot.has_traffic() {
        tracing::debug!(engine, "Minute {} summary: no traffic", snapshot.started_at.format("%H:%M"));
        return;
    }

    tracing::info!(
        engine,
        total = snapshot.total,
        success = snapshot.success,
        timeout = snapshot.timeout,
        server_error = snapshot.server_error,
        other_error = snapshot.other_error,
        "Minute {} summary: success {:.2}% | timeout {:.2}% | mean {} | p95 {}",
        snapshot.started_at.format("%H:%M"),
        snapshot.success_rate,
        snapshot.timeout_rate,
        format_ms(snapshot.mean_latency_ms),
        format_ms(snapshot.p95_latency_ms)
    );
}

fn format_ms(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |ms| format!("{:.0}ms", ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertStatus, RuleStatus, SinkError};
    use crate::metrics::minute_start;
    use crate::probe::OutcomeKind;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;
    use std::time::Duration;

    const M0: i64 = 28_400_000;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AlertEvent>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn notify(&self, _event: &AlertEvent) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn monitor_with(sink: Arc<dyn NotificationSink>) -> Monitor {
        let mut monitor = Monitor::new(Thresholds::default(), 3, sink);
        monitor.register_engine("google");
        monitor
    }

    fn outcome(engine: &str, minute: i64, kind: OutcomeKind) -> Outcome {
        let at = minute_start(minute) + ChronoDuration::seconds(5);
        let latency = Duration::from_millis(400);
        match kind {
            OutcomeKind::Success => Outcome::success(engine, at, latency, 8192).unwrap(),
            kind => Outcome::failure(engine, at, kind, latency).unwrap(),
        }
    }

    /// Record `success` successes and `failures` network errors for a minute.
    fn fill(monitor: &mut Monitor, engine: &str, minute: i64, success: usize, failures: usize) {
        for _ in 0..success {
            monitor.record(&outcome(engine, minute, OutcomeKind::Success));
        }
        for _ in 0..failures {
            monitor.record(&outcome(engine, minute, OutcomeKind::NetworkError));
        }
    }

    #[test]
    fn test_fires_once_then_resolves() {
        let sink = Arc::new(RecordingSink::default());
        let mut monitor = monitor_with(sink.clone());

        for minute in M0..M0 + 3 {
            fill(&mut monitor, "google", minute, 9, 1);
        }
        assert!(monitor.tick(M0).is_empty());
        assert!(monitor.tick(M0 + 1).is_empty());
        let events = monitor.tick(M0 + 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AlertStatus::Firing);

        fill(&mut monitor, "google", M0 + 3, 19, 1);
        let events = monitor.tick(M0 + 3);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AlertStatus::Resolved);

        let delivered = sink.events.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].engine, "google");
    }

    #[test]
    fn test_duplicate_tick_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let mut monitor = monitor_with(sink.clone());

        fill(&mut monitor, "google", M0, 0, 5);
        monitor.tick(M0);
        assert_eq!(monitor.rule_state("google", AlertRule::LowSuccessRate).unwrap().consecutive, 1);

        assert!(monitor.tick(M0).is_empty());
        assert!(monitor.tick(M0 - 1).is_empty());
        assert_eq!(monitor.rule_state("google", AlertRule::LowSuccessRate).unwrap().consecutive, 1);
        assert_eq!(monitor.history("google").unwrap().len(), 1);
    }

    #[test]
    fn test_skipped_minutes_are_caught_up() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));

        fill(&mut monitor, "google", M0, 0, 5);
        monitor.tick(M0);
        fill(&mut monitor, "google", M0 + 3, 0, 5);
        monitor.tick(M0 + 3);

        let history = monitor.history("google").unwrap();
        let minutes: Vec<i64> = history.last(3).iter().map(|s| s.minute).collect();
        assert_eq!(minutes, vec![M0 + 1, M0 + 2, M0 + 3]);
        assert!(!history.last(3)[0].has_traffic());
        assert_eq!(monitor.last_finalized("google"), Some(M0 + 3));

        // The empty minutes in between do not break the streak.
        assert_eq!(monitor.rule_state("google", AlertRule::LowSuccessRate).unwrap().consecutive, 2);
    }

    #[test]
    fn test_zero_traffic_minute_keeps_counter() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));

        fill(&mut monitor, "google", M0, 1, 9);
        monitor.tick(M0);
        monitor.tick(M0 + 1);
        fill(&mut monitor, "google", M0 + 2, 1, 9);
        monitor.tick(M0 + 2);

        let state = monitor.rule_state("google", AlertRule::LowSuccessRate).unwrap();
        assert_eq!(state.consecutive, 2);
        assert_eq!(state.status, RuleStatus::Normal);
    }

    #[test]
    fn test_late_outcome_is_dropped() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));
        fill(&mut monitor, "google", M0, 3, 0);
        monitor.tick(M0);

        let status = monitor.record(&outcome("google", M0, OutcomeKind::Success));
        assert_eq!(status, RecordStatus::Late);
        assert_eq!(monitor.late_outcomes(), 1);
        assert_eq!(monitor.history("google").unwrap().latest().unwrap().total, 3);
    }

    #[test]
    fn test_outcomes_counted_by_issuance_minute() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));

        // A probe issued in M0 that completes after M0 + 1 opened still lands in M0.
        fill(&mut monitor, "google", M0 + 1, 2, 0);
        fill(&mut monitor, "google", M0, 1, 0);
        monitor.tick(M0);

        assert_eq!(monitor.history("google").unwrap().latest().unwrap().total, 1);
        monitor.tick(M0 + 1);
        assert_eq!(monitor.history("google").unwrap().latest().unwrap().total, 2);
    }

    #[test]
    fn test_open_future_windows_survive_tick() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));
        fill(&mut monitor, "google", M0 + 5, 4, 0);
        monitor.tick(M0 + 4);

        // The first tick starts from the earliest open minute or the tick minute.
        assert_eq!(monitor.history("google").unwrap().len(), 1);
        monitor.tick(M0 + 5);
        assert_eq!(monitor.history("google").unwrap().latest().unwrap().total, 4);
    }

    #[test]
    fn test_history_per_engine_capped() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));
        for minute in M0..M0 + 5 {
            fill(&mut monitor, "google", minute, 1, 0);
            fill(&mut monitor, "bing", minute, 2, 0);
            fill(&mut monitor, "yandex", minute, 3, 0);
        }
        monitor.tick(M0 + 4);

        for engine in ["google", "bing", "yandex"] {
            let history = monitor.history(engine).unwrap();
            assert_eq!(history.len(), 3);
            let minutes: Vec<i64> = history.last(3).iter().map(|s| s.minute).collect();
            assert_eq!(minutes, vec![M0 + 2, M0 + 3, M0 + 4]);
        }
    }

    #[test]
    fn test_burst_fires_per_minute() {
        let sink = Arc::new(RecordingSink::default());
        let mut monitor = monitor_with(sink.clone());

        for minute in [M0, M0 + 1] {
            for _ in 0..3 {
                monitor.record(&outcome("google", minute, OutcomeKind::ServerError(502)));
            }
            fill(&mut monitor, "google", minute, 97, 0);
        }
        monitor.tick(M0 + 1);

        let delivered = sink.events.lock().unwrap();
        let bursts: Vec<i64> = delivered
            .iter()
            .filter(|e| e.rule == AlertRule::ServerErrorBurst)
            .map(|e| e.snapshot.minute)
            .collect();
        assert_eq!(bursts, vec![M0, M0 + 1]);
        assert_eq!(delivered.len(), 2);
    }

    #[test]
    fn test_sink_failure_does_not_block_state() {
        let mut monitor = monitor_with(Arc::new(FailingSink));
        for minute in M0..M0 + 3 {
            fill(&mut monitor, "google", minute, 0, 4);
            fill(&mut monitor, "bing", minute, 0, 4);
        }

        let events = monitor.tick(M0 + 2);
        assert_eq!(events.len(), 2);
        for engine in ["google", "bing"] {
            assert_eq!(
                monitor.rule_state(engine, AlertRule::LowSuccessRate).unwrap().status,
                RuleStatus::Alerting
            );
        }

        // Still failing: no re-alert while the state stays Alerting.
        fill(&mut monitor, "google", M0 + 3, 0, 4);
        assert!(monitor.tick(M0 + 3).is_empty());
    }

    #[test]
    fn test_final_state_lists_open_alerts() {
        let mut monitor = monitor_with(Arc::new(RecordingSink::default()));
        monitor.register_engine("bing");
        monitor.register_engine("yandex");

        for minute in M0..M0 + 3 {
            fill(&mut monitor, "google", minute, 0, 4);
            fill(&mut monitor, "bing", minute, 4, 0);
        }
        monitor.tick(M0 + 2);

        let alerting = monitor.log_final_state();
        assert_eq!(alerting, vec![("google".to_string(), AlertRule::LowSuccessRate)]);
        assert_eq!(monitor.last_finalized("bing"), Some(M0 + 2));
        assert_eq!(monitor.history("google").unwrap().len(), 3);
        // An engine with no traffic at all starts at the ticked minute.
        assert_eq!(monitor.history("yandex").unwrap().len(), 1);
    }
}
