//! serpmon - search engine proxy health monitor
//!
//! Probes search engines through a SERP proxy API, aggregates outcomes into
//! per-minute windows and raises alerts over DingTalk.

mod alert;
mod config;
mod metrics;
mod monitor;
mod probe;
mod scheduler;

use alert::dingtalk::DingTalkNotifier;
use alert::{LogSink, NotificationSink};
use config::MonitorConfig;
use monitor::Monitor;
use probe::SerpProbe;
use scheduler::Scheduler;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const NOTIFY_QUEUE_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "serpmon", version, about = "Search engine proxy health monitor")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "SERPMON_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Only monitor these engines
    #[arg(long, num_args = 1..)]
    engines: Vec<String>,

    /// Monitoring duration in minutes, overriding the config file
    #[arg(long)]
    duration: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive("serpmon=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Resolve once the configured duration has elapsed or Ctrl-C is pressed.
async fn wait_for_stop(duration: Option<Duration>) {
    let elapsed = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = elapsed => tracing::info!("Monitoring duration elapsed, stopping"),
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => tracing::info!("Interrupted, stopping"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    // Load configuration
    let mut cfg = MonitorConfig::load(&cli.config)?;
    if !cli.engines.is_empty() {
        cfg.retain_engines(&cli.engines)?;
    }
    if let Some(minutes) = cli.duration {
        cfg.monitoring.monitor_duration_minutes = Some(minutes);
    }

    let engines: Vec<&str> = cfg.search_engines.keys().map(String::as_str).collect();
    tracing::info!("Starting serpmon using {}", cli.config.display());
    tracing::info!("Engines: {}", engines.join(", "));
    tracing::info!(
        "{} search terms, concurrency {}, {} probes/min per engine, timeout {:.1}s",
        cfg.search_terms.len(),
        cfg.monitoring.concurrency,
        cfg.monitoring.requests_per_engine_per_minute,
        cfg.monitoring.timeout_seconds
    );
    match cfg.monitoring.monitor_duration_minutes {
        Some(0) => {
            tracing::info!("Monitoring duration is 0 minutes, nothing to do");
            return Ok(());
        }
        Some(minutes) => tracing::info!("Monitoring for {} minutes", minutes),
        None => tracing::info!("Monitoring until interrupted"),
    }

    // Pick the notification sink
    let mut delivery = None;
    let sink: Arc<dyn NotificationSink> = match &cfg.dingtalk.webhook {
        Some(webhook) => {
            let notifier =
                DingTalkNotifier::new(webhook, &cfg.dingtalk.keyword, cfg.dingtalk.timeout())?;
            let (sink, handle) = alert::spawn_delivery_worker(notifier, NOTIFY_QUEUE_CAPACITY);
            delivery = Some(handle);
            Arc::new(sink)
        }
        None => {
            tracing::warn!("No DingTalk webhook configured, alerts will only be logged");
            Arc::new(LogSink)
        }
    };
    tracing::info!("Alerts go to the {} sink", sink.name());

    let monitor = Monitor::from_config(&cfg, sink);
    let probe = Arc::new(SerpProbe::new(&cfg)?);
    let duration = cfg.monitoring.monitor_duration();
    let scheduler = Scheduler::new(Arc::new(cfg), probe);

    let (stop_tx, _) = broadcast::channel(1);
    let stopper = stop_tx.clone();
    tokio::spawn(async move {
        wait_for_stop(duration).await;
        let _ = stopper.send(());
    });

    let monitor = scheduler.run(monitor, &stop_tx).await;
    let alerting = monitor.log_final_state();
    tracing::info!(
        "Monitoring finished, {} late outcomes dropped, {} rules still alerting",
        monitor.late_outcomes(),
        alerting.len()
    );

    // Dropping the monitor releases the sink so the delivery queue can drain.
    drop(monitor);
    if let Some(handle) = delivery {
        handle.await?;
    }

    Ok(())
}
