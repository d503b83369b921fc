//! Scheduler module for running probes and driving minute rollover.

use crate::config::MonitorConfig;
use crate::metrics::minute_epoch;
use crate::monitor::Monitor;
use crate::probe::{Outcome, Probe};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};

const OUTCOME_CHANNEL_CAPACITY: usize = 1000;

/// How often the aggregator checks whether a minute can be closed.
const CLOCK_RESOLUTION: Duration = Duration::from_secs(1);

/// Runs one probe loop per engine and a single aggregator that owns the
/// [`Monitor`].
///
/// Outcomes count toward the minute their probe was issued in. Minute M is
/// finalized once the clock passes the end of M plus the request timeout
/// (plus one second), so every probe issued in M has reported by then.
pub struct Scheduler<P: Probe + 'static> {
    config: Arc<MonitorConfig>,
    probe: Arc<P>,
}

impl<P: Probe + 'static> Scheduler<P> {
    pub fn new(config: Arc<MonitorConfig>, probe: Arc<P>) -> Self {
        Self { config, probe }
    }

    /// Grace period before a minute is finalized.
    pub fn grace(&self) -> Duration {
        self.config.monitoring.timeout() + Duration::from_secs(1)
    }

    /// Probe until `stop` fires, then drain in-flight probes and finalize
    /// the last partial minute. Returns the monitor for inspection.
    pub async fn run(&self, mut monitor: Monitor, stop: &broadcast::Sender<()>) -> Monitor {
        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let terms = Arc::new(self.config.search_terms.clone());

        tracing::info!(
            "Starting scheduler with {} engines, {} probes/min each, concurrency {}",
            self.config.search_engines.len(),
            self.config.monitoring.requests_per_engine_per_minute,
            self.config.monitoring.concurrency
        );

        for engine in self.config.search_engines.keys() {
            let probe_loop = ProbeLoop {
                engine: engine.clone(),
                terms: terms.clone(),
                probe: self.probe.clone(),
                interval: self.config.monitoring.probe_interval(),
                concurrency: self.config.monitoring.concurrency,
            };
            tokio::spawn(run_probe_loop(probe_loop, tx.clone(), stop.subscribe()));
        }

        // Only probe tasks hold senders now; the channel closes once they finish.
        drop(tx);

        run_aggregator(&mut monitor, rx, self.grace()).await;
        monitor
    }
}

struct ProbeLoop<P: Probe + 'static> {
    engine: String,
    terms: Arc<Vec<String>>,
    probe: Arc<P>,
    interval: Duration,
    concurrency: usize,
}

/// Run the probe loop for a single engine.
async fn run_probe_loop<P: Probe + 'static>(
    probe_loop: ProbeLoop<P>,
    tx: mpsc::Sender<Outcome>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let semaphore = Arc::new(Semaphore::new(probe_loop.concurrency.max(1)));

    let mut interval = tokio::time::interval(probe_loop.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping probe for {} due to concurrency limit", probe_loop.engine);
                        continue;
                    }
                };

                let Some(term) = pick_term(&probe_loop.terms) else {
                    break;
                };

                let probe = probe_loop.probe.clone();
                let engine = probe_loop.engine.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done

                    let issued_at = Utc::now();

                    // Add jitter to avoid thundering herd
                    let jitter = rand::thread_rng().gen_range(0..100);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;

                    let outcome = match probe.probe(&engine, &term, issued_at).await {
                        Ok(o) => o,
                        Err(e) => {
                            tracing::error!("Probe failed for {}: {}", engine, e);
                            return;
                        }
                    };

                    tracing::debug!(
                        engine = %engine,
                        "[{}] {:?} in {:.2}s, {} bytes",
                        term,
                        outcome.kind(),
                        outcome.latency().as_secs_f64(),
                        outcome.payload_size().unwrap_or(0)
                    );

                    if tx.send(outcome).await.is_err() {
                        tracing::error!("Failed to send outcome for {}", engine);
                    }
                });
            }
        }
    }

    tracing::info!("Scheduler: stopped probing {}", probe_loop.engine);
}

fn pick_term(terms: &[String]) -> Option<String> {
    terms.choose(&mut rand::thread_rng()).cloned()
}

/// Latest minute that may be finalized at `now`.
pub fn due_minute(now: DateTime<Utc>, grace: Duration) -> i64 {
    let grace = ChronoDuration::milliseconds(grace.as_millis() as i64);
    minute_epoch(now - grace) - 1
}

/// Fold outcomes and close minutes until every probe task has finished.
async fn run_aggregator(monitor: &mut Monitor, mut rx: mpsc::Receiver<Outcome>, grace: Duration) {
    // Minutes before startup have no probes; never finalize them.
    let first_minute = minute_epoch(Utc::now());

    let mut clock = tokio::time::interval(CLOCK_RESOLUTION);
    clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(outcome) => {
                        monitor.record(&outcome);
                    }
                    None => break,
                }
            }
            _ = clock.tick() => {
                let due = due_minute(Utc::now(), grace);
                if due >= first_minute {
                    monitor.tick(due);
                }
            }
        }
    }

    let last_minute = minute_epoch(Utc::now());
    tracing::info!("Scheduler: in-flight probes drained, finalizing through minute {}", last_minute);
    monitor.tick(last_minute);
}
