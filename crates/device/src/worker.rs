use std::time::{Duration, Instant};

use async_trait::async_trait;
use config::DeviceConfig;
use metrics::{DeviceHealthPublisher, MetricsRegistry};
use signal::{Signal, ShutdownToken, TickReceiver};
use task::TaskCleaner;
use transport::{ModbusTransport, TransportState};

use crate::grouping::{group_channels, ChannelGroup};
use crate::queue::FrameQueueSender;
use crate::{AcquiredAt, RawFrame, RawFrameCause};

/// Forced-reconnect threshold: after this many consecutive failed reads
/// the worker closes the transport and re-enters `Connecting`, per C3's
/// contract, rather than retrying the same dead connection forever.
const FORCED_RECONNECT_THRESHOLD: u32 = 3;

/// Upper bound on the exponential retry backoff within one tick.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// One device's cooperative polling task: owns a transport, paces reads
/// on a fixed schedule, and emits [`RawFrame`]s until cancelled.
pub struct DeviceWorker {
    device_id: String,
    config: DeviceConfig,
    transport: Box<dyn ModbusTransport>,
    frames: FrameQueueSender,
    shutdown: ShutdownToken,
    metrics: MetricsRegistry,
    health: DeviceHealthPublisher,
}

impl DeviceWorker {
    /// Builds a worker for one device. `transport` should already be
    /// disconnected; `run` performs the first connect itself.
    pub fn new(
        config: DeviceConfig,
        transport: Box<dyn ModbusTransport>,
        frames: FrameQueueSender,
        shutdown: ShutdownToken,
        metrics: MetricsRegistry,
        health: DeviceHealthPublisher,
    ) -> Self {
        Self {
            device_id: config.device_id.clone(),
            config,
            transport,
            frames,
            shutdown,
            metrics,
            health,
        }
    }

    /// Runs the worker to completion: ticks until cancelled, then closes
    /// the transport and returns a cleanup handle for the task manager.
    pub async fn run(mut self) -> Box<dyn TaskCleaner> {
        let groups = group_channels(&self.config.channels);
        let device_id = self.device_id.clone();

        if groups.is_empty() {
            tracing::warn!(device_id = %device_id, "device has no enabled channels, worker is idle");
        }

        let mut ticks = TickReceiver::new(Duration::from_millis(self.config.poll_interval_ms), self.shutdown.clone());

        loop {
            match ticks.recv().await {
                Signal::Shutdown => break,
                Signal::Tick { .. } => self.poll_once(&groups).await,
            }
        }

        self.transport.close().await;
        tracing::info!(device_id = %device_id, "device worker stopped");
        Box::new(DeviceWorkerCleaner { device_id })
    }

    async fn poll_once(&mut self, groups: &[ChannelGroup]) {
        if self.transport.state() != TransportState::Connected {
            if let Err(err) = self.transport.connect().await {
                tracing::warn!(device_id = %self.device_id, error = %err, "reconnect attempt failed");
                for group in groups {
                    self.emit_bad(group, err.to_string());
                }
                return;
            }
            self.health.update(|h| h.is_connected = true);
        }

        for group in groups {
            self.poll_group(group).await;
        }
    }

    async fn poll_group(&mut self, group: &ChannelGroup) {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.transport.read(group.start_register, group.register_span).await {
                Ok(registers) => {
                    let acquisition_duration = started.elapsed();
                    self.health.update(|h| h.record_success(acquisition_duration));
                    self.emit_ok(group, &registers, acquisition_duration);
                    return;
                }
                Err(err) => {
                    self.health.update(|h| h.record_failure());

                    if attempt >= self.config.max_retries {
                        tracing::warn!(
                            device_id = %self.device_id,
                            start_register = group.start_register,
                            attempts = attempt + 1,
                            error = %err,
                            "modbus read failed, giving up for this tick"
                        );
                        self.emit_bad(group, err.to_string());
                        self.maybe_force_reconnect().await;
                        return;
                    }

                    let backoff = self.retry_backoff(attempt);
                    tracing::debug!(
                        device_id = %self.device_id,
                        start_register = group.start_register,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "modbus read failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let millis = self.config.retry_backoff_ms.saturating_mul(factor);
        Duration::from_millis(millis).min(MAX_RETRY_BACKOFF)
    }

    async fn maybe_force_reconnect(&mut self) {
        if self.health.get().consecutive_failures >= FORCED_RECONNECT_THRESHOLD {
            tracing::warn!(
                device_id = %self.device_id,
                "consecutive failure threshold reached, forcing reconnect"
            );
            self.transport.close().await;
            self.health.update(|h| h.mark_disconnected());
        }
    }

    fn emit_ok(&self, group: &ChannelGroup, registers: &[u16], acquisition_duration: Duration) {
        let acquired_at = AcquiredAt::now();
        for member in &group.members {
            let start = member.offset as usize;
            let end = start + member.register_count as usize;
            let frame = RawFrame {
                device_id: self.device_id.clone(),
                channel_number: member.channel_number,
                registers: registers[start..end].to_vec(),
                acquired_at,
                acquisition_duration,
                cause: RawFrameCause::Ok,
            };
            self.emit(frame);
        }
    }

    fn emit_bad(&self, group: &ChannelGroup, reason: String) {
        let acquired_at = AcquiredAt::now();
        for member in &group.members {
            let frame = RawFrame {
                device_id: self.device_id.clone(),
                channel_number: member.channel_number,
                registers: vec![0; member.register_count as usize],
                acquired_at,
                acquisition_duration: Duration::ZERO,
                cause: RawFrameCause::Bad { reason: reason.clone() },
            };
            self.emit(frame);
        }
    }

    fn emit(&self, frame: RawFrame) {
        if self.frames.push(frame) {
            self.metrics.record_dropped_frame();
        }
    }
}

#[derive(Debug)]
struct DeviceWorkerCleaner {
    device_id: String,
}

#[async_trait]
impl TaskCleaner for DeviceWorkerCleaner {
    async fn cleanup(&self) {
        tracing::debug!(device_id = %self.device_id, "device worker task cleaned up");
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use config::{ChannelConfig, DataType};
    use metrics::MetricsRegistry;
    use transport::SimulatedTransport;

    use super::*;
    use crate::queue::FrameQueue;

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            device_id: "line-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 200,
            poll_interval_ms: 20,
            max_retries: 1,
            retry_backoff_ms: 1,
            enabled: true,
            channels: vec![ChannelConfig {
                channel_number: 0,
                name: "ch0".to_string(),
                start_register: 0,
                register_count: 1,
                data_type: DataType::UInt16,
                scale_factor: 1.0,
                offset: 0.0,
                decimal_places: 0,
                min_value: 0.0,
                max_value: 1_000_000.0,
                max_change_rate: None,
                enabled: true,
                tags: HashMap::new(),
            }],
            tags: HashMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_good_frame_on_successful_read() {
        let metrics = MetricsRegistry::new();
        let (publisher, _health_handle) = metrics.register_device("line-1");

        let (sender, mut receiver) = FrameQueue::new(8);
        let shutdown = ShutdownToken::new();
        let transport: Box<dyn ModbusTransport> = Box::new(SimulatedTransport::new(1));

        let worker = DeviceWorker::new(device_config(), transport, sender, shutdown.clone(), metrics, publisher);

        let handle = tokio::spawn(worker.run());

        let frame = receiver.recv().await;
        assert_eq!(frame.device_id, "line-1");
        assert!(matches!(frame.cause, RawFrameCause::Ok));

        shutdown.cancel();
        let _ = handle.await;
    }
}
