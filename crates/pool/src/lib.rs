#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The device pool / orchestrator (C4): owns every device worker's
//! lifecycle, applies the replacement policy on `update`, and forwards
//! each worker's emitted frames into the single shared channel the stream
//! processor reads from. Every operation here is idempotent with respect
//! to `device_id`, per the contract in the pool's operation table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::DeviceConfig;
use device::{DeviceWorker, FrameQueue, RawFrame};
use metrics::{DeviceHealth, MetricsRegistry};
use signal::ShutdownToken;
use task::{JoinHandleTask, TaskCleaner};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use transport::{ModbusTransport, SimulatedTransport, TcpModbusTransport};

/// Minimum number of registers a probe read asks for, used when a device
/// has no configured channels yet (an otherwise-idle worker).
const DEFAULT_PROBE_REGISTER: u16 = 0;

/// Frame emission capacity per enabled channel, per the device worker
/// contract (`8 * channel_count`).
const FRAMES_PER_CHANNEL: usize = 8;

/// Errors returned by pool operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `add` was called for a `device_id` already known to the pool.
    #[error("device `{device_id}` already exists")]
    AlreadyExists {
        /// The conflicting device identifier.
        device_id: String,
    },

    /// The operation named a `device_id` the pool has no record of.
    #[error("device `{device_id}` not found")]
    NotFound {
        /// The unknown device identifier.
        device_id: String,
    },

    /// The operation's inputs were inconsistent with pool state, e.g. a
    /// mismatched `device_id` between the target and the supplied config.
    #[error("invalid operation for device `{device_id}`: {reason}")]
    Invalid {
        /// The device the operation targeted.
        device_id: String,
        /// Why the operation was rejected.
        reason: String,
    },
}

/// A running worker and the glue that forwards its frames onward, kept
/// together so `update`/`remove`/`disable` can tear both down with one
/// shutdown signal.
struct RunningWorker {
    shutdown: ShutdownToken,
    worker_join: JoinHandleTask,
    forwarder_join: JoinHandleTask,
    health: metrics::DeviceHealthHandle,
    timeout_hint: u64,
}

/// One device's entry in the pool: its last-applied configuration, plus a
/// running worker if the device is currently enabled.
struct DeviceEntry {
    config: DeviceConfig,
    running: Option<RunningWorker>,
}

/// Orchestrates every device worker's lifecycle. Cheap to clone; every
/// clone shares the same underlying device map and frame-forwarding
/// channel.
#[derive(Clone)]
pub struct DevicePool {
    devices: Arc<RwLock<HashMap<String, DeviceEntry>>>,
    frames_out: mpsc::Sender<RawFrame>,
    metrics: MetricsRegistry,
    demo_mode: bool,
}

impl DevicePool {
    /// Creates an empty pool. `frames_out` is the single shared channel
    /// the stream processor (C5) reads from; every device worker's own
    /// bounded emission queue is forwarded into it. `demo_mode` selects
    /// [`SimulatedTransport`] for every device instead of real Modbus/TCP
    /// sockets.
    pub fn new(frames_out: mpsc::Sender<RawFrame>, metrics: MetricsRegistry, demo_mode: bool) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            frames_out,
            metrics,
            demo_mode,
        }
    }

    /// Adds a new device, starting its worker immediately if
    /// `config.enabled`. Fails with [`Error::AlreadyExists`] if
    /// `device_id` is already known.
    pub async fn add(&self, config: DeviceConfig) -> Result<(), Error> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&config.device_id) {
            return Err(Error::AlreadyExists {
                device_id: config.device_id,
            });
        }

        let running = if config.enabled { Some(self.spawn_worker(&config)?) } else { None };
        let _ = devices.insert(config.device_id.clone(), DeviceEntry { config, running });
        Ok(())
    }

    /// Replaces `device_id`'s configuration. Per the replacement policy:
    /// the new worker is started first (if the new config is enabled),
    /// then the old worker is signalled to stop and given up to its own
    /// `timeout_ms` to drain an in-flight read before this call returns.
    /// If the new worker fails to start, the old one is left running
    /// untouched and this call fails without having swapped anything in.
    pub async fn update(&self, device_id: &str, config: DeviceConfig) -> Result<(), Error> {
        if config.device_id != device_id {
            return Err(Error::Invalid {
                device_id: device_id.to_string(),
                reason: "device_id in the replacement config does not match the target".to_string(),
            });
        }

        let mut devices = self.devices.write().await;
        if !devices.contains_key(device_id) {
            return Err(Error::NotFound {
                device_id: device_id.to_string(),
            });
        }

        // Start the replacement before touching the map at all, so a
        // failure here leaves the old entry (and its running worker, if
        // any) exactly as it was -- the rollback the replacement policy
        // requires.
        let new_running = if config.enabled { Some(self.spawn_worker(&config)?) } else { None };

        let old = devices
            .insert(device_id.to_string(), DeviceEntry { config, running: new_running })
            .expect("checked above");
        drop(devices);

        if let Some(old_running) = old.running {
            self.drain(device_id, old_running, old.config.timeout_ms).await;
        }

        Ok(())
    }

    /// Stops and removes a device entirely. The in-flight read, if any, is
    /// cancelled and the worker is awaited to completion (no timeout,
    /// since the device is leaving the pool rather than being replaced).
    pub async fn remove(&self, device_id: &str) -> Result<(), Error> {
        let mut devices = self.devices.write().await;
        let Some(entry) = devices.remove(device_id) else {
            return Err(Error::NotFound {
                device_id: device_id.to_string(),
            });
        };
        drop(devices);

        if let Some(running) = entry.running {
            running.shutdown.cancel();
            let _ = running.worker_join.await;
            let _ = running.forwarder_join.await;
        }
        self.metrics.unregister_device(device_id);
        Ok(())
    }

    /// Stops and restarts `device_id`'s worker with its current
    /// configuration, using the same drain-then-swap policy as `update`.
    pub async fn restart(&self, device_id: &str) -> Result<(), Error> {
        let devices = self.devices.read().await;
        let config = devices
            .get(device_id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| Error::NotFound {
                device_id: device_id.to_string(),
            })?;
        drop(devices);
        self.update(device_id, config).await
    }

    /// Starts or stops `device_id`'s worker without discarding its
    /// configuration, toggling `DeviceConfig::enabled` to match.
    pub async fn set_enabled(&self, device_id: &str, enabled: bool) -> Result<(), Error> {
        let mut devices = self.devices.write().await;
        let Some(entry) = devices.get_mut(device_id) else {
            return Err(Error::NotFound {
                device_id: device_id.to_string(),
            });
        };

        if entry.config.enabled == enabled {
            return Ok(());
        }

        if enabled {
            // Only flip `enabled` once the worker has actually started, so
            // a failed spawn leaves the entry exactly as it was rather than
            // recording "enabled" with no running worker behind it.
            let running = self.spawn_worker(&entry.config)?;
            entry.config.enabled = true;
            entry.running = Some(running);
            Ok(())
        } else {
            entry.config.enabled = false;
            let timeout_ms = entry.config.timeout_ms;
            let running = entry.running.take();
            drop(devices);
            if let Some(running) = running {
                self.drain(device_id, running, timeout_ms).await;
            }
            Ok(())
        }
    }

    /// Snapshot of every known device's configuration and latest health.
    /// Disabled devices are included with default (never-connected)
    /// health.
    pub async fn list(&self) -> Vec<(DeviceConfig, DeviceHealth)> {
        let devices = self.devices.read().await;
        devices
            .values()
            .map(|entry| {
                let health = entry
                    .running
                    .as_ref()
                    .map(|running| running.health.get())
                    .unwrap_or_default();
                (entry.config.clone(), health)
            })
            .collect()
    }

    /// Probes connectivity to `device_id` with a short-lived transport,
    /// independent of any running worker's connection.
    pub async fn test(&self, device_id: &str) -> Result<bool, Error> {
        let devices = self.devices.read().await;
        let config = devices
            .get(device_id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| Error::NotFound {
                device_id: device_id.to_string(),
            })?;
        drop(devices);

        let mut transport = self.build_transport(&config);
        let probe_ok = transport.connect().await.is_ok() && transport.test().await.is_ok();
        transport.close().await;
        Ok(probe_ok)
    }

    /// Stops every running worker and empties the pool. Used only while the
    /// supervisor is draining for shutdown; unlike `remove`, it does not
    /// return errors for devices that were never running.
    pub async fn shutdown(&self) {
        let mut devices = self.devices.write().await;
        let ids: Vec<String> = devices.keys().cloned().collect();
        let taken: Vec<(String, Option<RunningWorker>)> = ids
            .into_iter()
            .map(|id| {
                let running = devices.get_mut(&id).and_then(|entry| entry.running.take());
                (id, running)
            })
            .collect();
        devices.clear();
        drop(devices);

        for (device_id, running) in taken {
            if let Some(running) = running {
                let timeout_ms = running.timeout_hint;
                self.drain(&device_id, running, timeout_ms).await;
            }
            self.metrics.unregister_device(&device_id);
        }
    }

    /// Builds the transport for `config` and starts its worker and
    /// forwarder tasks. Fails without spawning anything or registering
    /// metrics if the transport's target doesn't even pass a synchronous
    /// preflight check (e.g. a host/port that can't be parsed into an
    /// endpoint), so callers can roll back to whatever was running before
    /// instead of leaving half-started state behind.
    fn spawn_worker(&self, config: &DeviceConfig) -> Result<RunningWorker, Error> {
        let device_id = config.device_id.clone();
        let transport = self.build_transport(config);
        transport.preflight().map_err(|source| Error::Invalid {
            device_id: device_id.clone(),
            reason: format!("transport preflight failed: {source}"),
        })?;

        let shutdown = ShutdownToken::new();
        let (health_publisher, health_handle) = self.metrics.register_device(&device_id);

        let enabled_channels = config.channels.iter().filter(|c| c.enabled).count().max(1);
        let (frame_tx, frame_rx) = FrameQueue::new(FRAMES_PER_CHANNEL * enabled_channels);

        let worker = DeviceWorker::new(
            config.clone(),
            transport,
            frame_tx,
            shutdown.clone(),
            self.metrics.clone(),
            health_publisher,
        );
        let worker_join = tokio::spawn(worker.run());
        let forwarder_join = tokio::spawn(forward_frames(frame_rx, self.frames_out.clone(), shutdown.clone()));

        Ok(RunningWorker {
            shutdown,
            worker_join,
            forwarder_join,
            health: health_handle,
            timeout_hint: config.timeout_ms,
        })
    }

    fn build_transport(&self, config: &DeviceConfig) -> Box<dyn ModbusTransport> {
        if self.demo_mode {
            Box::new(SimulatedTransport::default())
        } else {
            let probe_register = config
                .channels
                .first()
                .map(|channel| channel.start_register)
                .unwrap_or(DEFAULT_PROBE_REGISTER);
            Box::new(TcpModbusTransport::new(
                config.host.clone(),
                config.port,
                config.unit_id,
                Duration::from_millis(config.timeout_ms),
                probe_register,
            ))
        }
    }

    async fn drain(&self, device_id: &str, running: RunningWorker, timeout_ms: u64) {
        running.shutdown.cancel();
        let deadline = Duration::from_millis(timeout_ms.max(1));
        if tokio::time::timeout(deadline, running.worker_join).await.is_err() {
            tracing::warn!(device_id, "device worker did not drain within its timeout, abandoning");
        }
        let _ = running.forwarder_join.await;
    }
}

/// Drains one worker's bounded frame queue into the shared channel the
/// stream processor reads from, exiting once shutdown is signalled or the
/// shared channel's receiver is gone.
async fn forward_frames(mut receiver: device::FrameQueueReceiver, out: mpsc::Sender<RawFrame>, shutdown: ShutdownToken) -> Box<dyn TaskCleaner> {
    loop {
        tokio::select! {
            frame = receiver.recv() => {
                tokio::select! {
                    result = out.send(frame) => {
                        if result.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    Box::new(ForwarderCleaner)
}

#[derive(Debug)]
struct ForwarderCleaner;

#[async_trait]
impl TaskCleaner for ForwarderCleaner {
    async fn cleanup(&self) {
        tracing::debug!("device frame forwarder task cleaned up");
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use config::{ChannelConfig, DataType};

    use super::*;

    fn channel() -> ChannelConfig {
        ChannelConfig {
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
        }
    }

    fn device(device_id: &str, enabled: bool) -> DeviceConfig {
        DeviceConfig {
            device_id: device_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 50,
            poll_interval_ms: 20,
            max_retries: 1,
            retry_backoff_ms: 1,
            enabled,
            channels: vec![channel()],
            tags: HashMap::new(),
        }
    }

    fn test_pool() -> (DevicePool, mpsc::Receiver<RawFrame>) {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        (DevicePool::new(frames_tx, MetricsRegistry::new(), true), frames_rx)
    }

    /// A pool that builds real `TcpModbusTransport`s instead of simulated
    /// ones, so a device with an unparsable host exercises the preflight
    /// failure path in `spawn_worker`.
    fn non_demo_pool() -> (DevicePool, mpsc::Receiver<RawFrame>) {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        (DevicePool::new(frames_tx, MetricsRegistry::new(), false), frames_rx)
    }

    fn device_with_host(device_id: &str, host: &str) -> DeviceConfig {
        let mut config = device(device_id, true);
        config.host = host.to_string();
        config
    }

    #[tokio::test(start_paused = true)]
    async fn add_starts_a_worker_that_forwards_frames() {
        let (pool, mut frames_rx) = test_pool();
        pool.add(device("line-1", true)).await.expect("add succeeds");

        let frame = frames_rx.recv().await.expect("a frame should be forwarded");
        assert_eq!(frame.device_id, "line-1");

        let listed = pool.list().await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn add_is_rejected_for_a_duplicate_device_id() {
        let (pool, _frames_rx) = test_pool();
        pool.add(device("line-1", false)).await.expect("first add succeeds");
        let err = pool.add(device("line-1", false)).await.expect_err("duplicate add should fail");
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn operations_on_an_unknown_device_fail_with_not_found() {
        let (pool, _frames_rx) = test_pool();
        assert!(matches!(pool.remove("ghost").await, Err(Error::NotFound { .. })));
        assert!(matches!(pool.restart("ghost").await, Err(Error::NotFound { .. })));
        assert!(matches!(pool.set_enabled("ghost", true).await, Err(Error::NotFound { .. })));
        assert!(matches!(pool.test("ghost").await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn disabled_device_has_no_running_worker_until_enabled() {
        let (pool, mut frames_rx) = test_pool();
        pool.add(device("line-1", false)).await.expect("add succeeds");

        assert!(
            tokio::time::timeout(Duration::from_millis(20), frames_rx.recv()).await.is_err(),
            "a disabled device must not emit frames"
        );

        pool.set_enabled("line-1", true).await.expect("enable succeeds");
        let frame = tokio::time::timeout(Duration::from_secs(1), frames_rx.recv())
            .await
            .expect("recv should not time out")
            .expect("a frame should arrive once enabled");
        assert_eq!(frame.device_id, "line-1");
    }

    #[tokio::test]
    async fn remove_stops_the_worker_and_drops_it_from_list() {
        let (pool, _frames_rx) = test_pool();
        pool.add(device("line-1", true)).await.expect("add succeeds");
        pool.remove("line-1").await.expect("remove succeeds");

        assert!(pool.list().await.is_empty());
    }

    #[tokio::test]
    async fn update_rejects_a_mismatched_device_id() {
        let (pool, _frames_rx) = test_pool();
        pool.add(device("line-1", true)).await.expect("add succeeds");

        let err = pool
            .update("line-1", device("line-2", true))
            .await
            .expect_err("mismatched device_id should be rejected");
        assert!(matches!(err, Error::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_probes_connectivity_without_a_running_worker() {
        let (pool, _frames_rx) = test_pool();
        pool.add(device("line-1", false)).await.expect("add succeeds");

        let healthy = pool.test("line-1").await.expect("probe should succeed against a simulated transport");
        assert!(healthy);
    }

    #[tokio::test]
    async fn add_fails_without_inserting_when_the_endpoint_is_unparsable() {
        let (pool, _frames_rx) = non_demo_pool();

        let err = pool
            .add(device_with_host("line-1", "not a host"))
            .await
            .expect_err("add should fail its transport preflight");
        assert!(matches!(err, Error::Invalid { .. }));
        assert!(pool.list().await.is_empty());
    }

    #[tokio::test]
    async fn update_rolls_back_to_the_old_worker_when_the_replacement_fails_to_start() {
        let (pool, _frames_rx) = non_demo_pool();
        pool.add(device_with_host("line-1", "127.0.0.1")).await.expect("add succeeds");

        let err = pool
            .update("line-1", device_with_host("line-1", "not a host"))
            .await
            .expect_err("update should fail its transport preflight");
        assert!(matches!(err, Error::Invalid { .. }));

        let listed = pool.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.host, "127.0.0.1", "the old config must still be in effect");
    }

    #[tokio::test]
    async fn set_enabled_leaves_the_device_disabled_when_the_worker_fails_to_start() {
        let (pool, _frames_rx) = non_demo_pool();
        // A disabled device never calls `spawn_worker` on `add`, so an
        // unparsable host is only discovered once something tries to
        // enable it.
        pool.add(device_with_host("line-1", "not a host")).await.expect("disabled add never spawns a worker");

        let err = pool.set_enabled("line-1", true).await.expect_err("enabling should fail its transport preflight");
        assert!(matches!(err, Error::Invalid { .. }));

        let listed = pool.list().await;
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].0.enabled, "the device must remain disabled after a failed enable");
    }
}
