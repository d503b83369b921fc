//! Notification sinks.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::dingtalk::DingTalkNotifier;
use super::AlertEvent;

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification queue is closed")]
    Closed,
}

/// Receives alert events from the monitor.
///
/// `notify` is called on the rollover path and must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &AlertEvent) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

/// Sink used when no webhook is configured: events only reach the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
        tracing::info!(
            engine = %event.engine,
            rule = %event.rule,
            status = %event.status,
            "No webhook configured, skipping notification: {} {} {} (value {:.2}, threshold {:.2})",
            event.engine.to_uppercase(),
            event.rule.title(),
            event.status,
            event.value,
            event.threshold
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Hands events to a background delivery worker.
pub struct ChannelSink {
    tx: mpsc::Sender<AlertEvent>,
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: &AlertEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::QueueFull,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn name(&self) -> &str {
        "dingtalk"
    }
}

/// Start the delivery worker. The worker exits once every [`ChannelSink`]
/// clone is dropped and the queue is drained.
pub fn spawn_delivery_worker(
    notifier: DingTalkNotifier,
    capacity: usize,
) -> (ChannelSink, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(run_delivery_worker(rx, notifier));
    (ChannelSink { tx }, handle)
}

async fn run_delivery_worker(mut rx: mpsc::Receiver<AlertEvent>, notifier: DingTalkNotifier) {
    while let Some(event) = rx.recv().await {
        match notifier.send(&event).await {
            Ok(()) => tracing::info!(
                "DingTalk: delivered {} {} for {}",
                event.rule,
                event.status,
                event.engine
            ),
            Err(e) => tracing::error!(
                "DingTalk: failed to deliver {} {} for {}: {}",
                event.rule,
                event.status,
                event.engine,
                e
            ),
        }
    }

    tracing::debug!("DingTalk: delivery queue drained");
}
