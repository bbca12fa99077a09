//! Supervisor (C8): owns the process's whole lifecycle -- wiring every
//! component together at startup, driving the `Initializing -> Running ->
//! Draining -> Stopped` state machine, and applying configuration reloads.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use config::{RootConfig, WriterConfig, WriterSettings};
use context::ProcessContext;
use metrics::MetricsRegistry;
use pool::DevicePool;
use signal::ShutdownToken;
use task::labels::TaskLabels;
use task::{JoinHandleTask, TaskManager};
use tokio::sync::mpsc;
use writer::{BatchedWriter, DeadLetterQueue, InfluxTarget, NullTarget, TimescaleTarget, WriteTarget, WriterHandle};

use crate::error::SupervisorError;
use crate::observability;
use crate::pipeline::{self, StreamCommand};

/// Where the supervisor currently sits in its lifecycle. Logged on every
/// transition; not otherwise exposed outside the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// Size of the frame channel shared by every device worker's forwarder and
/// the stream processor. Generous relative to any single device's own
/// bounded queue, since it only has to absorb scheduling jitter across
/// devices, not sustained backpressure.
const FRAME_CHANNEL_CAPACITY: usize = 4096;

/// Size of the channel the supervisor uses to tell the stream task about
/// registrations; reloads are rare, so this never needs to be large.
const STREAM_COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Deadline for the final writer flush during drain, as a multiple of the
/// configured flush interval.
const FINAL_FLUSH_DEADLINE_MULTIPLIER: u32 = 2;

/// Deadline for the stream task to drain its already-in-flight frames once
/// every device worker has been torn down.
const STREAM_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Owns every long-running component and the configuration currently in
/// effect. Not `Clone`: there is exactly one supervisor per process.
pub struct Supervisor {
    context: ProcessContext,
    config_path: PathBuf,
    config: RootConfig,
    pool: DevicePool,
    stream_commands: mpsc::Sender<StreamCommand>,
    stream_join: JoinHandleTask,
    writer_handle: WriterHandle,
    writer_shutdown: ShutdownToken,
    task_manager: TaskManager,
    state: State,
}

impl Supervisor {
    /// Builds every component from `config` and starts the initially
    /// configured devices. Nothing here blocks on device connectivity --
    /// workers connect and poll independently once spawned.
    pub async fn new(context: ProcessContext, config_path: PathBuf, config: RootConfig) -> Result<Self, SupervisorError> {
        let mut task_manager = TaskManager::with_process_labels(task::labels::ProcessLabels::new(context.process_id()));
        let metrics = MetricsRegistry::new();
        let writer_shutdown = ShutdownToken::new();

        let (writer_handle, writer_join, redrain_join) =
            build_writer(config.writer(), &config.writer_settings, metrics.clone(), writer_shutdown.clone()).await?;
        task_manager.register(writer_join, &TaskLabels::new("writer", "batched-writer", context.process_id()));
        task_manager.register(redrain_join, &TaskLabels::new("writer", "dlq-redrain", context.process_id()));

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (stream_commands_tx, stream_commands_rx) = mpsc::channel(STREAM_COMMAND_CHANNEL_CAPACITY);
        let stream_join = pipeline::spawn(metrics.clone(), frames_rx, stream_commands_rx, writer_handle.clone());

        let metrics_timer_join = observability::spawn(metrics.clone(), writer_shutdown.clone());
        task_manager.register(metrics_timer_join, &TaskLabels::new("observability", "metrics-timer", context.process_id()));

        let pool = DevicePool::new(frames_tx, metrics, config.demo_mode);

        let mut supervisor = Self {
            context,
            config_path,
            config: config.clone(),
            pool,
            stream_commands: stream_commands_tx,
            stream_join,
            writer_handle,
            writer_shutdown,
            task_manager,
            state: State::Initializing,
        };

        for device in &config.devices {
            supervisor.stream_commands.send(StreamCommand::RegisterDevice(Box::new(device.clone()))).await.ok();
            supervisor.pool.add(device.clone()).await?;
        }

        supervisor.state = State::Running;
        tracing::info!(device_count = supervisor.config.devices.len(), demo_mode = supervisor.config.demo_mode, "supervisor running");
        Ok(supervisor)
    }

    /// Runs until an OS shutdown signal arrives, applying configuration
    /// reloads on `SIGHUP` along the way, then drains and returns.
    #[cfg(unix)]
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = terminate.recv() => break,
                _ = hangup.recv() => self.reload().await,
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Runs until `Ctrl-C` arrives. Configuration reloads are only wired to
    /// `SIGHUP` on unix targets.
    #[cfg(not(unix))]
    pub async fn run(self) -> Result<(), SupervisorError> {
        let _ = tokio::signal::ctrl_c().await;
        self.drain().await;
        Ok(())
    }

    /// Validates and loads the configuration file again, diffs it against
    /// what is currently running, and applies only the difference. A
    /// validation failure logs a warning and leaves the previous
    /// configuration in effect untouched.
    async fn reload(&mut self) {
        if self.state != State::Running {
            tracing::warn!(state = ?self.state, "ignoring reload signal outside the running state");
            return;
        }

        tracing::info!(path = %self.config_path.display(), "reload signal received, re-reading configuration");

        let new_config = match config::load_and_validate(&self.config_path) {
            Ok(new_config) => new_config,
            Err(err) => {
                tracing::warn!(error = %err, "config reload rejected, keeping previous configuration");
                return;
            }
        };

        let diff = config::diff(&self.config, &new_config);
        if diff.is_empty() {
            self.config = new_config;
            tracing::info!("config reloaded: no device changes");
            return;
        }

        for device_id in &diff.removed {
            if let Err(err) = self.pool.remove(device_id).await {
                tracing::warn!(device_id = %device_id, error = %err, "failed to remove device during reload");
            }
            self.stream_commands.send(StreamCommand::UnregisterDevice(device_id.clone())).await.ok();
        }

        for device in diff.added.iter().chain(diff.updated.iter()) {
            self.stream_commands.send(StreamCommand::RegisterDevice(Box::new(device.clone()))).await.ok();
        }

        for device in &diff.added {
            if let Err(err) = self.pool.add(device.clone()).await {
                tracing::warn!(device_id = %device.device_id, error = %err, "failed to add device during reload");
            }
        }

        for device in &diff.updated {
            if let Err(err) = self.pool.update(&device.device_id, device.clone()).await {
                tracing::warn!(device_id = %device.device_id, error = %err, "failed to update device during reload");
            }
        }

        tracing::info!(
            added = diff.added.len(),
            updated = diff.updated.len(),
            removed = diff.removed.len(),
            "config reloaded"
        );
        self.config = new_config;
    }

    /// Stops accepting device changes, tears down every device worker,
    /// lets the stream task drain what was already in flight, forces a
    /// final writer flush, then stops the writer and dead-letter re-drain
    /// tasks.
    async fn drain(mut self) {
        self.state = State::Draining;
        tracing::info!("supervisor draining");
        let Self {
            context,
            pool,
            stream_commands,
            stream_join,
            writer_handle,
            writer_shutdown,
            task_manager,
            config,
            ..
        } = self;
        drop(stream_commands);

        pool.shutdown().await;

        if tokio::time::timeout(STREAM_DRAIN_DEADLINE, stream_join).await.is_err() {
            tracing::warn!("stream processing task did not drain within its deadline, abandoning");
        }

        let flush_deadline = Duration::from_millis(config.writer_settings.flush_interval_ms) * FINAL_FLUSH_DEADLINE_MULTIPLIER;
        if tokio::time::timeout(flush_deadline, writer_handle.flush()).await.is_err() {
            tracing::warn!("final writer flush did not complete within its deadline");
        }

        writer_shutdown.cancel();
        task_manager.join().await;

        let final_state = State::Stopped;
        tracing::info!(
            state = ?final_state,
            process_id = context.process_id(),
            uptime_secs = context.uptime().as_secs(),
            "supervisor stopped"
        );
    }
}

async fn build_writer(
    writer_config: WriterConfig,
    settings: &WriterSettings,
    metrics: MetricsRegistry,
    shutdown: ShutdownToken,
) -> Result<(WriterHandle, JoinHandleTask, JoinHandleTask), SupervisorError> {
    let dlq = Arc::new(DeadLetterQueue::open(settings.dlq_directory.clone(), settings.dlq_segment_size_bytes, settings.dlq_max_segments)?);

    match writer_config {
        WriterConfig::Influx(cfg) => {
            let target = Arc::new(InfluxTarget::new(cfg, Duration::from_secs(10))?);
            Ok(spin_up(target, settings, dlq, metrics, shutdown))
        }
        WriterConfig::Timescale(cfg) => {
            let target = Arc::new(TimescaleTarget::new(cfg).await?);
            Ok(spin_up(target, settings, dlq, metrics, shutdown))
        }
        WriterConfig::Null => {
            let target = Arc::new(NullTarget);
            Ok(spin_up(target, settings, dlq, metrics, shutdown))
        }
    }
}

fn spin_up<W: WriteTarget>(
    target: Arc<W>,
    settings: &WriterSettings,
    dlq: Arc<DeadLetterQueue>,
    metrics: MetricsRegistry,
    shutdown: ShutdownToken,
) -> (WriterHandle, JoinHandleTask, JoinHandleTask) {
    let healthy = Arc::new(AtomicBool::new(true));
    let probe_interval = Duration::from_millis(settings.health_probe_interval_ms);

    let (writer, handle) = BatchedWriter::new(target.clone(), settings, dlq.clone(), metrics.clone(), shutdown.clone(), healthy.clone());
    let writer_join = tokio::spawn(writer.run());
    let redrain_join = tokio::spawn(writer::run_dlq_redrain(target, dlq, healthy, metrics, probe_interval, shutdown));
    (handle, writer_join, redrain_join)
}
