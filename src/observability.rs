//! The cleanup/metrics timer: the one task in the scheduling model with no
//! producer of its own. It exists purely to give the process a periodic,
//! structured-logging view of [`metrics::MetricsSnapshot`] in place of a
//! metrics HTTP endpoint, which is out of scope for this process.

use std::time::Duration;

use metrics::MetricsRegistry;
use signal::{Signal, ShutdownToken, TickReceiver};
use task::TaskCleaner;

/// How often the snapshot is logged.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the timer task.
pub fn spawn(metrics: MetricsRegistry, shutdown: ShutdownToken) -> tokio::task::JoinHandle<Box<dyn TaskCleaner>> {
    tokio::spawn(async move {
        let mut ticks = TickReceiver::new(METRICS_LOG_INTERVAL, shutdown);

        loop {
            match ticks.recv().await {
                Signal::Shutdown => break,
                Signal::Tick { .. } => {
                    let snapshot = metrics.snapshot();
                    tracing::info!(
                        uptime_secs = snapshot.uptime.as_secs(),
                        good = snapshot.readings_by_quality.get("good").copied().unwrap_or(0),
                        bad = snapshot.readings_by_quality.get("bad").copied().unwrap_or(0),
                        batch_flushes = snapshot.batch_flushes,
                        dropped_frames = snapshot.dropped_frames,
                        dlq_depth = snapshot.dlq_depth,
                        writer_queue_depth = snapshot.writer_queue_depth,
                        device_count = snapshot.devices.len(),
                        cpu_percent = snapshot.cpu_percent,
                        rss_bytes = snapshot.rss_bytes,
                        "metrics snapshot"
                    );
                }
            }
        }

        tracing::debug!("metrics timer task stopped");
        Box::new(MetricsTimerCleaner) as Box<dyn TaskCleaner>
    })
}

#[derive(Debug)]
struct MetricsTimerCleaner;

#[async_trait::async_trait]
impl TaskCleaner for MetricsTimerCleaner {
    async fn cleanup(&self) {
        tracing::debug!("metrics timer task cleaned up");
    }
}
