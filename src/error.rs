//! The supervisor's own error type, wrapping every component error it can
//! encounter while wiring or running the process.

use thiserror::Error;

/// Errors that can abort the supervisor during startup or its run loop.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] config::Error),

    /// A dead-letter queue directory could not be created or read.
    #[error("failed to initialize dead-letter queue: {0}")]
    Io(#[from] std::io::Error),

    /// The configured write target could not be constructed (e.g. the
    /// TimescaleDB connection pool failed to establish).
    #[error(transparent)]
    Writer(#[from] writer::WriteError),

    /// A device pool operation failed.
    #[error(transparent)]
    Pool(#[from] pool::Error),
}
