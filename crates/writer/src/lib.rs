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

//! Batched writer (C6): buffers [`stream::Reading`]s, flushes by size or
//! interval to InfluxDB or TimescaleDB with retry/backoff, and spills
//! exhausted batches to a rotating dead-letter file that a background task
//! re-drains once the target recovers.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod batch;
mod dlq;
mod encode;
mod influx;
mod null;
mod timescale;
mod writer;

pub use batch::BatchBuffer;
pub use dlq::{DeadLetterQueue, DlqSegment};
pub use encode::{encode_line_protocol, encode_rows, EncodedBatch, TimescaleRow};
pub use influx::InfluxTarget;
pub use null::NullTarget;
pub use timescale::TimescaleTarget;
pub use writer::{BatchedWriter, WriterHandle};

/// Upper bound on retry backoff within a single flush attempt, per the
/// writer contract.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Errors a [`WriteTarget`] can report for one flush attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WriteError {
    /// A network-level failure (connect, timeout, reset) or a 5xx status;
    /// the caller should retry with backoff.
    #[error("transient write failure: {message}")]
    Transient {
        /// Description of the underlying failure.
        message: String,
    },

    /// A 4xx status or a payload the target rejected outright; retrying
    /// with the same batch cannot succeed.
    #[error("permanent write failure: {message}")]
    Permanent {
        /// Description of the rejection.
        message: String,
    },
}

impl WriteError {
    /// Whether this failure should be retried, per the writer's
    /// transient/permanent classification.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Transient { .. })
    }
}

/// A destination a [`BatchedWriter`] can flush batches to: InfluxDB,
/// TimescaleDB, or the null target used in dry-run and tests. Mirrors the
/// teacher's exporter trait: a minimal async surface the writer drives,
/// with health checked independently of the write path.
#[async_trait]
pub trait WriteTarget: Send + Sync + 'static {
    /// Writes one batch of readings. Implementations classify failures
    /// into [`WriteError::Transient`] or [`WriteError::Permanent`] so the
    /// caller can decide whether to retry or dead-letter immediately.
    async fn write_batch(&self, readings: &[stream::Reading]) -> Result<(), WriteError>;

    /// A lightweight liveness probe, independent of the write path, used to
    /// decide whether the dead-letter queue should attempt a re-drain.
    async fn probe_health(&self) -> bool;

    /// Encodes a batch into the bytes this target would send, so the
    /// dead-letter queue can persist exactly what was attempted and
    /// [`WriteTarget::replay_raw`] can resend it unchanged on re-drain.
    fn encode_for_dlq(&self, readings: &[stream::Reading]) -> Vec<u8>;

    /// Resends bytes previously produced by [`WriteTarget::encode_for_dlq`],
    /// without re-deriving them from `Reading`s. Used only by the
    /// dead-letter re-drain task.
    async fn replay_raw(&self, payload: &[u8]) -> Result<(), WriteError>;

    /// Human-readable name for logging (`"influxdb"`, `"timescaledb"`,
    /// `"null"`).
    fn name(&self) -> &'static str;
}
