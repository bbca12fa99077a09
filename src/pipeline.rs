//! The stream-processing glue task (C5): the single owner of
//! [`stream::StreamProcessor`]'s per-channel state, fed by the device pool's
//! shared frame channel and draining into the batched writer.
//!
//! Channel registration has to happen on this same task rather than from
//! the supervisor directly, since `StreamProcessor` is `&mut self` and is
//! not `Send`-shared across tasks; the supervisor issues
//! [`StreamCommand`]s instead of touching the processor itself.

use config::DeviceConfig;
use device::RawFrame;
use metrics::MetricsRegistry;
use stream::StreamProcessor;
use task::TaskCleaner;
use tokio::sync::mpsc;
use writer::WriterHandle;

/// A registration change the supervisor asks the stream task to apply.
pub enum StreamCommand {
    /// A device was added or replaced; (re-)register its enabled channels.
    RegisterDevice(Box<DeviceConfig>),
    /// A device was removed; drop its channel state.
    UnregisterDevice(String),
}

/// Spawns the stream-processing task. It runs until `frames` closes, which
/// happens once every device worker's forwarder has exited -- so a shutdown
/// is driven by tearing down the device pool first, not by cancelling this
/// task directly, letting it drain whatever was already in flight.
pub fn spawn(
    metrics: MetricsRegistry,
    mut frames: mpsc::Receiver<RawFrame>,
    mut commands: mpsc::Receiver<StreamCommand>,
    writer: WriterHandle,
) -> tokio::task::JoinHandle<Box<dyn TaskCleaner>> {
    tokio::spawn(async move {
        let mut processor = StreamProcessor::new(metrics);
        let mut commands_open = true;

        loop {
            tokio::select! {
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(StreamCommand::RegisterDevice(config)) => processor.register_device(&config),
                        Some(StreamCommand::UnregisterDevice(device_id)) => processor.unregister_device(&device_id),
                        None => commands_open = false,
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => writer.enqueue(processor.process(frame)).await,
                        None => break,
                    }
                }
            }
        }

        tracing::info!("stream processing task stopped");
        Box::new(StreamTaskCleaner) as Box<dyn TaskCleaner>
    })
}

#[derive(Debug)]
struct StreamTaskCleaner;

#[async_trait::async_trait]
impl TaskCleaner for StreamTaskCleaner {
    async fn cleanup(&self) {
        tracing::debug!("stream processing task cleaned up");
    }
}
