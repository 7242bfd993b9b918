//! Heartbeat reporter.
//!
//! Publishes a [`Report`] on `<root>.report` every interval while the worker
//! is alive. The first report goes out immediately so clients learn about a
//! fresh worker without waiting a full period. Publish failures are logged
//! and the loop carries on: a missed heartbeat is exactly what the cluster
//! tracker is built to tolerate.

use bytes::Bytes;
use common::bus::{report_topic, Bus};
use common::clock;
use common::error::BusError;
use common::types::SimpleMap;
use common::wire::{Report, ReportState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Publish one report for `worker_id`.
///
/// # Errors
///
/// Returns the bus error if the publish fails.
pub async fn publish_report(
    bus: &dyn Bus,
    root_topic: &str,
    worker_id: &str,
    state: ReportState,
    app_data: &SimpleMap,
) -> Result<(), BusError> {
    let report = Report::new(worker_id, state, app_data.clone(), clock::now());
    let payload =
        serde_json::to_vec(&report).map_err(|e| BusError::Transport(e.to_string()))?;
    bus.publish(&report_topic(root_topic), Bytes::from(payload))
        .await
}

/// Send `alive` reports until `cancel_token` fires.
#[instrument(skip_all, name = "worker.heartbeat", fields(worker_id = %worker_id))]
pub async fn run_heartbeat(
    bus: Arc<dyn Bus>,
    root_topic: String,
    worker_id: String,
    app_data: SimpleMap,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        target: "worker.heartbeat",
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "Heartbeat started"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(target: "worker.heartbeat", "Heartbeat stopped");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = publish_report(
                    bus.as_ref(),
                    &root_topic,
                    &worker_id,
                    ReportState::Alive,
                    &app_data,
                )
                .await
                {
                    warn!(target: "worker.heartbeat", error = %e, "Failed to publish heartbeat");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::bus::MemoryBus;
    use common::types::SimpleValue;

    async fn next_report(subscription: &mut common::bus::Subscription) -> Report {
        let message = subscription.recv().await.expect("bus closed");
        serde_json::from_slice(&message.payload).expect("report should decode")
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_immediately_then_every_interval() {
        let bus = Arc::new(MemoryBus::new());
        let mut reports = bus.subscribe(&report_topic("test")).await.unwrap();
        let cancel = CancellationToken::new();

        let mut app_data = SimpleMap::new();
        app_data.insert("process".to_string(), SimpleValue::from("p1"));

        let task = tokio::spawn(run_heartbeat(
            bus.clone(),
            "test".to_string(),
            "w1".to_string(),
            app_data.clone(),
            Duration::from_millis(2500),
            cancel.clone(),
        ));

        let first = next_report(&mut reports).await;
        assert_eq!(first.worker_id, "w1");
        assert_eq!(first.state, ReportState::Alive);
        assert_eq!(first.app_data, app_data);

        tokio::time::advance(Duration::from_millis(2500)).await;
        let second = next_report(&mut reports).await;
        assert!(second.time > first.time, "report time is monotone");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_dead_report() {
        let bus = MemoryBus::new();
        let mut reports = bus.subscribe(&report_topic("test")).await.unwrap();

        publish_report(&bus, "test", "w1", ReportState::Dead, &SimpleMap::new())
            .await
            .unwrap();

        let report = next_report(&mut reports).await;
        assert_eq!(report.state, ReportState::Dead);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "report");
    }
}
