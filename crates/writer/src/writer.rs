use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::WriterSettings;
use metrics::MetricsRegistry;
use signal::{Signal, ShutdownToken, TickReceiver};
use stream::Reading;
use task::TaskCleaner;
use tokio::sync::{mpsc, oneshot};

use crate::batch::BatchBuffer;
use crate::dlq::DeadLetterQueue;
use crate::{WriteError, WriteTarget, MAX_RETRY_BACKOFF};

enum WriterCommand {
    Enqueue(Reading),
    Flush(oneshot::Sender<()>),
}

/// Handle used by producers (the stream processor) to enqueue readings and
/// force flushes. Cheap to clone; every clone shares the same writer task.
#[derive(Clone)]
pub struct WriterHandle {
    commands: mpsc::Sender<WriterCommand>,
    half_flush_interval: Duration,
    healthy: Arc<AtomicBool>,
}

impl WriterHandle {
    /// Enqueues one reading. If the send would block for longer than half
    /// the flush interval, forces an out-of-schedule flush first, per the
    /// writer's backpressure contract, so a momentarily full buffer never
    /// stalls the producer indefinitely.
    pub async fn enqueue(&self, reading: Reading) {
        let send = self.commands.send(WriterCommand::Enqueue(reading.clone()));
        if tokio::time::timeout(self.half_flush_interval, send).await.is_ok() {
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.commands.send(WriterCommand::Flush(ack_tx)).await;
        let _ = ack_rx.await;
        let _ = self.commands.send(WriterCommand::Enqueue(reading)).await;
    }

    /// Forces an immediate flush of whatever is currently buffered and
    /// waits for it to complete.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(WriterCommand::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Whether the most recent independent health probe against the
    /// active target succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Batched writer (C6): buffers readings, flushes them to a [`WriteTarget`]
/// by size or interval, retries transient failures with capped exponential
/// backoff, and dead-letters batches that exhaust their retries.
pub struct BatchedWriter<W: WriteTarget> {
    target: Arc<W>,
    buffer: BatchBuffer,
    commands: mpsc::Receiver<WriterCommand>,
    dlq: Arc<DeadLetterQueue>,
    metrics: MetricsRegistry,
    shutdown: ShutdownToken,
    max_retry_attempts: u32,
    retry_delay: Duration,
    flush_interval: Duration,
}

impl<W: WriteTarget> BatchedWriter<W> {
    /// Builds a writer and its producer-facing handle. The input channel's
    /// capacity is `2 * batch_size`, per the writer's channel-sizing
    /// contract. `healthy` should be the same handle passed to
    /// [`run_dlq_redrain`], so [`WriterHandle::is_healthy`] reflects the
    /// independent health probe rather than the write path.
    pub fn new(
        target: Arc<W>,
        settings: &WriterSettings,
        dlq: Arc<DeadLetterQueue>,
        metrics: MetricsRegistry,
        shutdown: ShutdownToken,
        healthy: Arc<AtomicBool>,
    ) -> (Self, WriterHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(settings.batch_size.saturating_mul(2).max(2));
        let flush_interval = Duration::from_millis(settings.flush_interval_ms);

        let writer = Self {
            target,
            buffer: BatchBuffer::new(settings.batch_size, flush_interval),
            commands: commands_rx,
            dlq,
            metrics,
            shutdown,
            max_retry_attempts: settings.max_retry_attempts,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            flush_interval,
        };
        let handle = WriterHandle {
            commands: commands_tx,
            half_flush_interval: flush_interval / 2,
            healthy,
        };
        (writer, handle)
    }

    /// Runs the writer to completion: buffers, flushes on trigger, and
    /// performs one best-effort final flush once cancelled.
    pub async fn run(mut self) -> Box<dyn TaskCleaner> {
        let poll_period = (self.flush_interval / 4).max(Duration::from_millis(50));
        let mut ticks = TickReceiver::new(poll_period, self.shutdown.clone());

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(WriterCommand::Enqueue(reading)) => {
                            self.buffer.push(reading);
                            self.metrics.set_writer_queue_depth(self.buffer.len() as u64);
                            if self.buffer.should_flush() {
                                self.flush_buffer().await;
                            }
                        }
                        Some(WriterCommand::Flush(ack)) => {
                            self.flush_buffer().await;
                            let _ = ack.send(());
                        }
                        None => break,
                    }
                }
                signal = ticks.recv() => {
                    match signal {
                        Signal::Tick { .. } => {
                            if self.buffer.should_flush() {
                                self.flush_buffer().await;
                            }
                        }
                        Signal::Shutdown => break,
                    }
                }
            }
        }

        self.flush_buffer().await;
        tracing::info!("batched writer stopped");
        Box::new(WriterCleaner)
    }

    async fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let readings = self.buffer.drain();
        self.metrics.set_writer_queue_depth(0);
        self.write_with_retry(readings).await;
    }

    async fn write_with_retry(&self, readings: Vec<Reading>) {
        let mut attempt = 0u32;
        loop {
            match self.target.write_batch(&readings).await {
                Ok(()) => {
                    self.metrics.record_batch_flush();
                    return;
                }
                Err(WriteError::Permanent { message }) => {
                    tracing::warn!(error = %message, target = self.target.name(), "write permanently rejected, dead-lettering batch");
                    self.dead_letter(&readings).await;
                    return;
                }
                Err(WriteError::Transient { message }) => {
                    if attempt >= self.max_retry_attempts {
                        tracing::warn!(
                            error = %message,
                            target = self.target.name(),
                            attempts = attempt + 1,
                            "write retries exhausted, dead-lettering batch"
                        );
                        self.dead_letter(&readings).await;
                        return;
                    }

                    let backoff = self.retry_backoff(attempt);
                    tracing::debug!(error = %message, target = self.target.name(), attempt, backoff_ms = backoff.as_millis() as u64, "write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let millis = self.retry_delay.as_millis() as u64;
        Duration::from_millis(millis.saturating_mul(factor)).min(MAX_RETRY_BACKOFF)
    }

    async fn dead_letter(&self, readings: &[Reading]) {
        let payload = self.target.encode_for_dlq(readings);
        let dlq = self.dlq.clone();
        let depth = tokio::task::spawn_blocking(move || {
            if let Err(err) = dlq.append(&payload) {
                tracing::error!(error = %err, "failed to append batch to dead-letter queue, readings lost");
            }
            dlq.depth()
        })
        .await
        .unwrap_or(0);
        self.metrics.set_dlq_depth(depth);
    }
}

#[derive(Debug)]
struct WriterCleaner;

#[async_trait]
impl TaskCleaner for WriterCleaner {
    async fn cleanup(&self) {
        tracing::debug!("batched writer task cleaned up");
    }
}

/// Runs the background dead-letter re-drain task: probes target health on
/// its own schedule, independent of the write path, and re-enqueues
/// persisted segments once the probe recovers.
pub async fn run_dlq_redrain<W: WriteTarget>(
    target: Arc<W>,
    dlq: Arc<DeadLetterQueue>,
    healthy: Arc<AtomicBool>,
    metrics: MetricsRegistry,
    probe_interval: Duration,
    shutdown: ShutdownToken,
) -> Box<dyn TaskCleaner> {
    let mut ticks = TickReceiver::new(probe_interval, shutdown);

    loop {
        match ticks.recv().await {
            Signal::Shutdown => break,
            Signal::Tick { .. } => {
                let probe_ok = target.probe_health().await;
                healthy.store(probe_ok, Ordering::Relaxed);
                if probe_ok {
                    redrain_once(&target, &dlq, &metrics).await;
                }
            }
        }
    }

    tracing::info!("dead-letter re-drain task stopped");
    Box::new(RedrainCleaner)
}

async fn redrain_once<W: WriteTarget>(target: &Arc<W>, dlq: &Arc<DeadLetterQueue>, metrics: &MetricsRegistry) {
    let listing_dlq = dlq.clone();
    let segments = match tokio::task::spawn_blocking(move || listing_dlq.list_segments()).await {
        Ok(Ok(segments)) => segments,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "failed to list dead-letter segments");
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "dead-letter segment listing task panicked");
            return;
        }
    };

    for segment in segments {
        let read_path = segment.path.clone();
        let payloads = match tokio::task::spawn_blocking(move || DeadLetterQueue::read_segment(&read_path)).await {
            Ok(Ok(payloads)) => payloads,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, path = %segment.path.display(), "failed to read dead-letter segment");
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "dead-letter segment read task panicked");
                continue;
            }
        };

        let mut all_succeeded = true;
        for payload in &payloads {
            if let Err(err) = target.replay_raw(payload).await {
                tracing::debug!(error = %err, "dead-letter replay failed, will retry next probe");
                all_succeeded = false;
                break;
            }
        }

        if all_succeeded {
            let removal_dlq = dlq.clone();
            let removal_segment = segment.clone();
            match tokio::task::spawn_blocking(move || removal_dlq.remove_segment(&removal_segment)).await {
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, path = %segment.path.display(), "failed to remove drained dead-letter segment");
                }
                Ok(Ok(())) | Err(_) => {}
            }
        } else {
            break;
        }
    }

    let depth_dlq = dlq.clone();
    let depth = tokio::task::spawn_blocking(move || depth_dlq.depth()).await.unwrap_or(0);
    metrics.set_dlq_depth(depth);
}

#[derive(Debug)]
struct RedrainCleaner;

#[async_trait]
impl TaskCleaner for RedrainCleaner {
    async fn cleanup(&self) {
        tracing::debug!("dead-letter re-drain task cleaned up");
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    use async_trait::async_trait;
    use metrics::Quality;

    use super::*;

    fn reading() -> Reading {
        Reading {
            device_id: "line-1".to_string(),
            channel_number: 0,
            timestamp: SystemTime::now(),
            raw_value: 1,
            overflow_offset: 0,
            processed_value: 1.0,
            rate_per_second: None,
            quality: Quality::Good,
            tags: HashMap::new(),
        }
    }

    struct CountingTarget {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl WriteTarget for CountingTarget {
        async fn write_batch(&self, _readings: &[Reading]) -> Result<(), WriteError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                Err(WriteError::Transient {
                    message: "simulated outage".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn probe_health(&self) -> bool {
            true
        }

        fn encode_for_dlq(&self, _readings: &[Reading]) -> Vec<u8> {
            b"batch".to_vec()
        }

        async fn replay_raw(&self, _payload: &[u8]) -> Result<(), WriteError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn settings() -> WriterSettings {
        WriterSettings {
            batch_size: 2,
            flush_interval_ms: 50,
            max_retry_attempts: 3,
            retry_delay_ms: 1,
            dlq_directory: "unused".to_string(),
            dlq_segment_size_bytes: 1024,
            dlq_max_segments: 4,
            health_probe_interval_ms: 1000,
        }
    }

    #[tokio::test]
    async fn flushes_once_batch_size_reached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = Arc::new(DeadLetterQueue::open(dir.path(), 1024, 4).expect("open dlq"));
        let target = Arc::new(CountingTarget {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let metrics = MetricsRegistry::new();
        let shutdown = ShutdownToken::new();

        let (writer, handle) = BatchedWriter::new(
            target.clone(),
            &settings(),
            dlq,
            metrics,
            shutdown.clone(),
            Arc::new(AtomicBool::new(true)),
        );
        let join = tokio::spawn(writer.run());

        handle.enqueue(reading()).await;
        handle.enqueue(reading()).await;
        handle.flush().await;

        shutdown.cancel();
        let _ = join.await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_letters_after_retries_exhausted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = Arc::new(DeadLetterQueue::open(dir.path(), 1024, 4).expect("open dlq"));
        let target = Arc::new(CountingTarget {
            calls: AtomicUsize::new(0),
            fail_first_n: 100,
        });
        let metrics = MetricsRegistry::new();
        let shutdown = ShutdownToken::new();

        let (writer, handle) = BatchedWriter::new(
            target.clone(),
            &settings(),
            dlq.clone(),
            metrics,
            shutdown.clone(),
            Arc::new(AtomicBool::new(true)),
        );
        let join = tokio::spawn(writer.run());

        handle.enqueue(reading()).await;
        handle.flush().await;

        shutdown.cancel();
        let _ = join.await;

        assert_eq!(dlq.depth(), 1);
    }
}
