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

//! The metrics/health surface (C7): atomically-updated counters and
//! gauges, per-device health tracked through a `watch` channel the way the
//! pack's MIDI client tracks task liveness, and process CPU/RSS sampled
//! through `sysinfo`. Everything here is read through [`MetricsRegistry::snapshot`];
//! no HTTP formatting happens in this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;

/// Coarse trustworthiness classification carried by every `Reading`. Owned
/// here, rather than by the stream processor, so the metrics counters and
/// the processor that produces them agree on one vocabulary without a
/// dependency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Normal, trustworthy reading.
    Good,
    /// A reset or a rate excursion was observed; value is plausible but
    /// not fully trusted.
    Uncertain,
    /// The transport reported an I/O failure, or the value is out of
    /// configured bounds.
    Bad,
    /// Static configuration made this channel undecodable.
    ConfigurationError,
    /// A true counter rollover was detected and compensated.
    Overflow,
}

impl Quality {
    fn index(self) -> usize {
        match self {
            Quality::Good => 0,
            Quality::Uncertain => 1,
            Quality::Bad => 2,
            Quality::ConfigurationError => 3,
            Quality::Overflow => 4,
        }
    }
}

const QUALITY_COUNT: usize = 5;

/// Point-in-time health of one device, updated by the device worker and
/// the pool, read by the metrics surface.
#[derive(Debug, Clone)]
pub struct DeviceHealth {
    /// Whether the transport is currently `Connected`.
    pub is_connected: bool,
    /// Wall-clock time of the last successful read, if any.
    pub last_successful_read: Option<SystemTime>,
    /// Wall-clock time of the last failed read, if any.
    pub last_failure: Option<SystemTime>,
    /// Consecutive failed reads since the last success.
    pub consecutive_failures: u32,
    /// Lifetime successful reads.
    pub total_reads: u64,
    /// Lifetime failed reads.
    pub total_failures: u64,
    /// Exponential moving average of read latency.
    pub mean_read_latency: Duration,
}

impl Default for DeviceHealth {
    fn default() -> Self {
        Self {
            is_connected: false,
            last_successful_read: None,
            last_failure: None,
            consecutive_failures: 0,
            total_reads: 0,
            total_failures: 0,
            mean_read_latency: Duration::ZERO,
        }
    }
}

impl DeviceHealth {
    /// Folds in a successful read observed with latency `latency`.
    pub fn record_success(&mut self, latency: Duration) {
        self.is_connected = true;
        self.last_successful_read = Some(SystemTime::now());
        self.consecutive_failures = 0;
        self.total_reads += 1;
        self.mean_read_latency = ewma(self.mean_read_latency, latency);
    }

    /// Folds in a failed read.
    pub fn record_failure(&mut self) {
        self.last_failure = Some(SystemTime::now());
        self.consecutive_failures += 1;
        self.total_failures += 1;
    }

    /// Marks the transport disconnected, e.g. after forced reconnect.
    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
    }
}

/// Weight chosen so roughly the last 10 samples dominate the average,
/// matching how the pack's health collectors smooth latency without
/// keeping a full sample history.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

fn ewma(previous: Duration, sample: Duration) -> Duration {
    if previous.is_zero() {
        return sample;
    }
    let previous_secs = previous.as_secs_f64();
    let sample_secs = sample.as_secs_f64();
    let blended = previous_secs * (1.0 - LATENCY_EWMA_ALPHA) + sample_secs * LATENCY_EWMA_ALPHA;
    Duration::from_secs_f64(blended.max(0.0))
}

/// A cloneable read handle onto one device's latest health. Cheap to
/// clone and safe to poll from any task, the receiving half of the
/// publisher the pool hands to the worker on spawn.
#[derive(Clone)]
pub struct DeviceHealthHandle {
    receiver: watch::Receiver<DeviceHealth>,
}

impl DeviceHealthHandle {
    /// The most recently published health snapshot.
    pub fn get(&self) -> DeviceHealth {
        self.receiver.borrow().clone()
    }
}

/// A consistent point-in-time read of every counter and gauge in the
/// registry, handed out by [`MetricsRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Time since the registry (and therefore the process) started.
    pub uptime: Duration,
    /// Readings emitted, by quality.
    pub readings_by_quality: HashMap<&'static str, u64>,
    /// Overflow events observed per `(device_id, channel_number)`.
    pub overflow_events: HashMap<(String, u16), u64>,
    /// Completed batch flushes to the writer target.
    pub batch_flushes: u64,
    /// Frames dropped under backpressure (oldest-drop policy).
    pub dropped_frames: u64,
    /// Readings currently resident in the dead-letter queue.
    pub dlq_depth: u64,
    /// Readings currently buffered ahead of the writer.
    pub writer_queue_depth: u64,
    /// Latest health per device.
    pub devices: HashMap<String, DeviceHealth>,
    /// Process CPU usage, percent of one core, averaged since the last
    /// sample.
    pub cpu_percent: f32,
    /// Resident set size, in bytes.
    pub rss_bytes: u64,
}

struct Inner {
    started_at: Instant,
    readings_by_quality: [AtomicU64; QUALITY_COUNT],
    overflow_events_by_channel: Mutex<HashMap<(String, u16), u64>>,
    batch_flushes: AtomicU64,
    dropped_frames: AtomicU64,
    dlq_depth: AtomicU64,
    writer_queue_depth: AtomicU64,
    device_health: Mutex<HashMap<String, watch::Sender<DeviceHealth>>>,
    system: Mutex<sysinfo::System>,
    pid: sysinfo::Pid,
}

/// Process-wide registry of counters, gauges, and per-device health. Cheap
/// to clone; every clone shares the same underlying atomics.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates a new, empty registry. Call once per process; every
    /// component that reports metrics clones this handle.
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or(sysinfo::Pid::from(0));
        Self {
            inner: Arc::new(Inner {
                started_at: Instant::now(),
                readings_by_quality: Default::default(),
                overflow_events_by_channel: Mutex::new(HashMap::new()),
                batch_flushes: AtomicU64::new(0),
                dropped_frames: AtomicU64::new(0),
                dlq_depth: AtomicU64::new(0),
                writer_queue_depth: AtomicU64::new(0),
                device_health: Mutex::new(HashMap::new()),
                system: Mutex::new(sysinfo::System::new()),
                pid,
            }),
        }
    }

    /// Records one emitted reading of the given quality.
    pub fn record_reading(&self, quality: Quality) {
        self.inner.readings_by_quality[quality.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a compensated counter rollover for one channel.
    pub fn record_overflow_event(&self, device_id: &str, channel_number: u16) {
        let mut events = self
            .inner
            .overflow_events_by_channel
            .lock()
            .expect("overflow_events_by_channel lock poisoned");
        *events.entry((device_id.to_string(), channel_number)).or_insert(0) += 1;
    }

    /// Records a completed flush to the writer target.
    pub fn record_batch_flush(&self) {
        self.inner.batch_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame dropped under backpressure.
    pub fn record_dropped_frame(&self) {
        self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the current dead-letter queue depth (in readings).
    pub fn set_dlq_depth(&self, depth: u64) {
        self.inner.dlq_depth.store(depth, Ordering::Relaxed);
    }

    /// Sets the current writer input queue depth (in readings).
    pub fn set_writer_queue_depth(&self, depth: u64) {
        self.inner.writer_queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Registers a device with the registry and returns a cloneable handle
    /// onto its health. Calling this again for an already-registered
    /// device replaces its publisher, resetting health to default — used
    /// when a worker is restarted.
    pub fn register_device(&self, device_id: &str) -> (DeviceHealthPublisher, DeviceHealthHandle) {
        let (sender, receiver) = watch::channel(DeviceHealth::default());
        let mut devices = self.inner.device_health.lock().expect("device_health lock poisoned");
        let _ = devices.insert(device_id.to_string(), sender.clone());
        (DeviceHealthPublisher { sender }, DeviceHealthHandle { receiver })
    }

    /// Removes a device's health entry, e.g. on `DevicePool::remove`.
    pub fn unregister_device(&self, device_id: &str) {
        let mut devices = self.inner.device_health.lock().expect("device_health lock poisoned");
        let _ = devices.remove(device_id);
    }

    /// Samples this process's CPU usage (percent of one core, averaged
    /// since the previous sample) and resident set size. Resolves the
    /// portability question around the source's Windows-only CPU counter
    /// by using one definition everywhere: process CPU time delta over
    /// wall-clock time, as `sysinfo` computes it.
    pub fn sample_process(&self) -> (f32, u64) {
        let mut system = self.inner.system.lock().expect("system lock poisoned");
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[self.inner.pid]), true);
        match system.process(self.inner.pid) {
            Some(process) => (process.cpu_usage(), process.memory()),
            None => (0.0, 0),
        }
    }

    /// Takes a consistent snapshot of every counter, gauge, and device
    /// health entry.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (cpu_percent, rss_bytes) = self.sample_process();

        let readings_by_quality = [
            ("good", Quality::Good),
            ("uncertain", Quality::Uncertain),
            ("bad", Quality::Bad),
            ("configuration_error", Quality::ConfigurationError),
            ("overflow", Quality::Overflow),
        ]
        .into_iter()
        .map(|(name, quality)| {
            (
                name,
                self.inner.readings_by_quality[quality.index()].load(Ordering::Relaxed),
            )
        })
        .collect();

        let overflow_events = self
            .inner
            .overflow_events_by_channel
            .lock()
            .expect("overflow_events_by_channel lock poisoned")
            .clone();

        let devices = self
            .inner
            .device_health
            .lock()
            .expect("device_health lock poisoned")
            .iter()
            .map(|(device_id, sender)| (device_id.clone(), sender.borrow().clone()))
            .collect();

        MetricsSnapshot {
            uptime: self.inner.started_at.elapsed(),
            readings_by_quality,
            overflow_events,
            batch_flushes: self.inner.batch_flushes.load(Ordering::Relaxed),
            dropped_frames: self.inner.dropped_frames.load(Ordering::Relaxed),
            dlq_depth: self.inner.dlq_depth.load(Ordering::Relaxed),
            writer_queue_depth: self.inner.writer_queue_depth.load(Ordering::Relaxed),
            devices,
            cpu_percent,
            rss_bytes,
        }
    }
}

/// The write half of a device's health, held by its worker. Updates are a
/// single short critical section inside `watch::Sender::send_modify`.
#[derive(Clone)]
pub struct DeviceHealthPublisher {
    sender: watch::Sender<DeviceHealth>,
}

impl DeviceHealthPublisher {
    /// Applies `update` to the current health and publishes the result.
    pub fn update(&self, update: impl FnOnce(&mut DeviceHealth)) {
        self.sender.send_modify(update);
    }

    /// The most recently published health snapshot.
    pub fn get(&self) -> DeviceHealth {
        self.sender.borrow().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reading_counts_are_tracked_per_quality() {
        let registry = MetricsRegistry::new();
        registry.record_reading(Quality::Good);
        registry.record_reading(Quality::Good);
        registry.record_reading(Quality::Bad);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.readings_by_quality["good"], 2);
        assert_eq!(snapshot.readings_by_quality["bad"], 1);
        assert_eq!(snapshot.readings_by_quality["overflow"], 0);
    }

    #[test]
    fn overflow_events_are_keyed_per_channel() {
        let registry = MetricsRegistry::new();
        registry.record_overflow_event("line-1", 0);
        registry.record_overflow_event("line-1", 0);
        registry.record_overflow_event("line-1", 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.overflow_events[&("line-1".to_string(), 0)], 2);
        assert_eq!(snapshot.overflow_events[&("line-1".to_string(), 1)], 1);
    }

    #[test]
    fn device_health_round_trips_through_the_handle() {
        let registry = MetricsRegistry::new();
        let (publisher, handle) = registry.register_device("line-1");

        assert!(!handle.get().is_connected);

        publisher.update(|health| health.record_success(Duration::from_millis(12)));
        let health = handle.get();
        assert!(health.is_connected);
        assert_eq!(health.total_reads, 1);
        assert_eq!(health.consecutive_failures, 0);

        publisher.update(|health| health.record_failure());
        assert_eq!(handle.get().consecutive_failures, 1);
    }

    #[test]
    fn unregister_removes_device_from_snapshot() {
        let registry = MetricsRegistry::new();
        let _ = registry.register_device("line-1");
        assert!(registry.snapshot().devices.contains_key("line-1"));

        registry.unregister_device("line-1");
        assert!(!registry.snapshot().devices.contains_key("line-1"));
    }

    #[test]
    fn dropped_frames_and_flushes_accumulate() {
        let registry = MetricsRegistry::new();
        registry.record_dropped_frame();
        registry.record_dropped_frame();
        registry.record_batch_flush();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.dropped_frames, 2);
        assert_eq!(snapshot.batch_flushes, 1);
    }
}
