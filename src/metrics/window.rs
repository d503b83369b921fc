//! Per-engine minute windows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tdigests::TDigest;

use crate::config::Thresholds;
use crate::probe::{Outcome, OutcomeKind};

/// Minute epoch (whole minutes since the Unix epoch) containing `dt`.
pub fn minute_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp().div_euclid(60)
}

/// Start of the given minute epoch.
pub fn minute_start(minute: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(minute * 60, 0).unwrap_or_default()
}

/// Statistics bucket an outcome is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Success,
    Timeout,
    ServerError,
    Other,
}

impl Bucket {
    /// Classify an outcome, treating slow and undersized successes as failures.
    pub fn classify(outcome: &Outcome, thresholds: &Thresholds) -> Self {
        match outcome.kind() {
            OutcomeKind::Success if outcome.latency() >= thresholds.timeout_limit => Bucket::Timeout,
            OutcomeKind::Success
                if outcome.payload_size().unwrap_or(0) < thresholds.min_content_size =>
            {
                Bucket::Other
            }
            OutcomeKind::Success => Bucket::Success,
            OutcomeKind::Timeout => Bucket::Timeout,
            OutcomeKind::ServerError(_) => Bucket::ServerError,
            OutcomeKind::ClientError(_)
            | OutcomeKind::NetworkError
            | OutcomeKind::InvalidContent(_) => Bucket::Other,
        }
    }
}

/// Running aggregate of one engine's outcomes within one minute.
#[derive(Debug, Clone, Default)]
pub struct MinuteWindow {
    total: u64,
    success: u64,
    timeout: u64,
    server_error: u64,
    other_error: u64,
    latency_sum: Duration,
    content_size_sum: u64,
    min_content_size: Option<u64>,
    /// Success latencies in milliseconds, for the p95 estimate.
    latencies: Vec<f64>,
}

impl MinuteWindow {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one outcome into the window.
    pub fn record(&mut self, outcome: &Outcome, thresholds: &Thresholds) -> Bucket {
        let bucket = Bucket::classify(outcome, thresholds);
        self.total += 1;

        match bucket {
            Bucket::Success => {
                self.success += 1;
                let size = outcome.payload_size().unwrap_or(0);
                self.latency_sum += outcome.latency();
                self.content_size_sum += size;
                self.min_content_size = Some(self.min_content_size.map_or(size, |m| m.min(size)));
                self.latencies.push(outcome.latency().as_micros() as f64 / 1000.0);
            }
            Bucket::Timeout => self.timeout += 1,
            Bucket::ServerError => self.server_error += 1,
            Bucket::Other => self.other_error += 1,
        }

        bucket
    }

    #[cfg(test)]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[cfg(test)]
    pub fn counts(&self) -> (u64, u64, u64, u64) {
        (self.success, self.timeout, self.server_error, self.other_error)
    }

    /// Consume the window and produce its read-only snapshot.
    pub fn finalize(self, minute: i64) -> MinuteSnapshot {
        let total = self.total;
        let rate = |count: u64, empty: f64| {
            if total == 0 {
                empty
            } else {
                count as f64 * 100.0 / total as f64
            }
        };

        let (mean_latency_ms, mean_content_size, p95_latency_ms) = if self.success > 0 {
            let n = self.success as f64;
            let p95 = TDigest::from_values(self.latencies).estimate_quantile(0.95);
            (
                Some(self.latency_sum.as_micros() as f64 / 1000.0 / n),
                Some(self.content_size_sum as f64 / n),
                Some(p95),
            )
        } else {
            (None, None, None)
        };

        MinuteSnapshot {
            minute,
            started_at: minute_start(minute),
            total,
            success: self.success,
            timeout: self.timeout,
            server_error: self.server_error,
            other_error: self.other_error,
            success_rate: rate(self.success, 100.0),
            timeout_rate: rate(self.timeout, 0.0),
            mean_latency_ms,
            p95_latency_ms,
            mean_content_size,
            min_content_size: self.min_content_size,
        }
    }
}

/// Finalized statistics for one engine and one minute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinuteSnapshot {
    pub minute: i64,
    pub started_at: DateTime<Utc>,
    pub total: u64,
    pub success: u64,
    pub timeout: u64,
    pub server_error: u64,
    pub other_error: u64,
    /// Percent; 100 when the minute had no traffic.
    pub success_rate: f64,
    /// Percent; 0 when the minute had no traffic.
    pub timeout_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub mean_content_size: Option<f64>,
    pub min_content_size: Option<u64>,
}

impl MinuteSnapshot {
    pub fn has_traffic(&self) -> bool {
        self.total > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap()
    }

    fn success(latency_ms: u64, size: u64) -> Outcome {
        Outcome::success("google", t0(), Duration::from_millis(latency_ms), size).unwrap()
    }

    fn failure(kind: OutcomeKind) -> Outcome {
        Outcome::failure("google", t0(), kind, Duration::from_millis(300)).unwrap()
    }

    #[test]
    fn test_minute_epoch() {
        let dt = t0();
        let minute = minute_epoch(dt);
        assert_eq!(minute_start(minute), Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap());
        assert_eq!(minute_epoch(minute_start(minute + 1)), minute + 1);

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 30).unwrap();
        assert_eq!(minute_epoch(before_epoch), -1);
    }

    #[test]
    fn test_buckets_sum_to_total() {
        let thresholds = Thresholds::default();
        let mut window = MinuteWindow::new();
        let outcomes = [
            success(200, 4096),
            success(15_000, 4096),
            success(200, 100),
            failure(OutcomeKind::Timeout),
            failure(OutcomeKind::ServerError(502)),
            failure(OutcomeKind::ServerError(500)),
            failure(OutcomeKind::ClientError(429)),
            failure(OutcomeKind::NetworkError),
            failure(OutcomeKind::InvalidContent(200)),
        ];

        for (i, outcome) in outcomes.iter().enumerate() {
            window.record(outcome, &thresholds);
            let (s, t, e, o) = window.counts();
            assert_eq!(s + t + e + o, window.total());
            assert_eq!(window.total(), i as u64 + 1);
        }

        assert_eq!(window.counts(), (1, 2, 2, 4));
    }

    #[test]
    fn test_slow_success_counts_as_timeout() {
        let thresholds = Thresholds::default();
        let mut window = MinuteWindow::new();
        assert_eq!(window.record(&success(10_000, 4096), &thresholds), Bucket::Timeout);
        assert_eq!(window.record(&success(9_999, 4096), &thresholds), Bucket::Success);

        let snapshot = window.finalize(1);
        assert_eq!(snapshot.timeout, 1);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.timeout_rate, 50.0);
        // Only the surviving success contributes latency.
        assert_eq!(snapshot.mean_latency_ms, Some(9_999.0));
    }

    #[test]
    fn test_undersized_success_counts_as_other() {
        let thresholds = Thresholds::default();
        let mut window = MinuteWindow::new();
        assert_eq!(window.record(&success(100, 2047), &thresholds), Bucket::Other);
        assert_eq!(window.record(&success(100, 2048), &thresholds), Bucket::Success);
    }

    #[test]
    fn test_finalize_rates_and_sizes() {
        let thresholds = Thresholds::default();
        let mut window = MinuteWindow::new();
        window.record(&success(100, 3000), &thresholds);
        window.record(&success(300, 5000), &thresholds);
        window.record(&failure(OutcomeKind::Timeout), &thresholds);
        window.record(&failure(OutcomeKind::ServerError(504)), &thresholds);

        let snapshot = window.finalize(42);
        assert_eq!(snapshot.minute, 42);
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.success_rate, 50.0);
        assert_eq!(snapshot.timeout_rate, 25.0);
        assert_eq!(snapshot.server_error, 1);
        assert_eq!(snapshot.mean_latency_ms, Some(200.0));
        assert_eq!(snapshot.mean_content_size, Some(4000.0));
        assert_eq!(snapshot.min_content_size, Some(3000));
        let p95 = snapshot.p95_latency_ms.unwrap();
        assert!((100.0..=300.0).contains(&p95));
    }

    #[test]
    fn test_empty_window_finalizes_as_healthy() {
        let snapshot = MinuteWindow::new().finalize(7);
        assert!(!snapshot.has_traffic());
        assert_eq!(snapshot.success_rate, 100.0);
        assert_eq!(snapshot.timeout_rate, 0.0);
        assert_eq!(snapshot.mean_latency_ms, None);
        assert_eq!(snapshot.min_content_size, None);
        assert_eq!(snapshot.started_at, minute_start(7));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn outcome_kind() -> impl Strategy<Value = OutcomeKind> {
            prop_oneof![
                Just(OutcomeKind::Success),
                Just(OutcomeKind::Timeout),
                (500u16..600).prop_map(OutcomeKind::ServerError),
                (400u16..500).prop_map(OutcomeKind::ClientError),
                Just(OutcomeKind::NetworkError),
                (200u16..300).prop_map(OutcomeKind::InvalidContent),
            ]
        }

        fn outcome() -> impl Strategy<Value = Outcome> {
            (outcome_kind(), 0u64..20_000, 0u64..8192).prop_map(|(kind, latency_ms, size)| {
                let latency = Duration::from_millis(latency_ms);
                let outcome = match kind {
                    OutcomeKind::Success => Outcome::success("google", t0(), latency, size),
                    kind => Outcome::failure("google", t0(), kind, latency),
                };
                outcome.unwrap()
            })
        }

        proptest! {
            #[test]
            fn buckets_always_sum_to_total(outcomes in prop::collection::vec(outcome(), 0..64)) {
                let thresholds = Thresholds::default();
                let mut window = MinuteWindow::new();

                for outcome in &outcomes {
                    window.record(outcome, &thresholds);
                    let (s, t, e, o) = window.counts();
                    prop_assert_eq!(s + t + e + o, window.total());
                }
                prop_assert_eq!(window.total(), outcomes.len() as u64);

                let snapshot = window.finalize(1);
                prop_assert_eq!(
                    snapshot.success + snapshot.timeout + snapshot.server_error + snapshot.other_error,
                    snapshot.total
                );
                prop_assert!((0.0..=100.0).contains(&snapshot.success_rate));
                prop_assert!((0.0..=100.0).contains(&snapshot.timeout_rate));
            }
        }
    }
}
