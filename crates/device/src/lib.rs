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

//! The device worker (C3): one task per enabled device, scheduling reads
//! on a fixed cadence, grouping contiguous channels into single Modbus
//! reads, and emitting [`RawFrame`]s to the stream processor through a
//! bounded, oldest-drop queue.

mod grouping;
mod queue;
mod worker;

pub use grouping::{group_channels, ChannelGroup, ChannelSlice};
pub use queue::{FrameQueue, FrameQueueReceiver, FrameQueueSender};
pub use worker::DeviceWorker;

use std::time::{Duration, Instant, SystemTime};

/// When a frame was acquired, carried as both a monotonic instant (for
/// rate/ordering arithmetic) and a wall-clock time (for the published
/// `Reading.timestamp`).
#[derive(Debug, Clone, Copy)]
pub struct AcquiredAt {
    /// Monotonic clock reading at acquisition.
    pub monotonic: Instant,
    /// Wall-clock time at acquisition.
    pub wall_clock: SystemTime,
}

impl AcquiredAt {
    /// Captures the current time on both clocks.
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall_clock: SystemTime::now(),
        }
    }
}

/// Why a [`RawFrame`] carries the data it does.
#[derive(Debug, Clone)]
pub enum RawFrameCause {
    /// The read that produced these registers succeeded.
    Ok,
    /// The read failed after exhausting retries within this tick; the
    /// register payload is a placeholder and the stream processor must
    /// classify the resulting reading as `Bad`.
    Bad {
        /// Description of the failure, for logs and diagnostics.
        reason: String,
    },
}

/// Output of the device worker (C3), input to the stream processor (C5).
/// Consumed exactly once.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Owning device.
    pub device_id: String,
    /// Channel within the device.
    pub channel_number: u16,
    /// Raw register words, `register_count` long.
    pub registers: Vec<u16>,
    /// When this frame was acquired.
    pub acquired_at: AcquiredAt,
    /// How long the read that produced it took.
    pub acquisition_duration: Duration,
    /// Whether the read succeeded.
    pub cause: RawFrameCause,
}
