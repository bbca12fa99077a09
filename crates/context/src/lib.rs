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

//! `ProcessContext` is the ambient state handed by construction into the
//! pool, the writer, and the supervisor, rather than a generic key-value bag
//! threaded through every constructor.

use std::time::Instant;

/// Process-wide context created once at startup and cloned into every
/// long-running component.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Stable identifier for this process, used in logs and metrics labels.
    process_id: String,
    /// Whether the process was started with `--demo-mode` (simulated
    /// transports instead of real Modbus/TCP connections).
    demo_mode: bool,
    /// When the process started, used to derive uptime.
    started_at: Instant,
}

impl ProcessContext {
    /// Creates a new context. `started_at` is captured here so uptime
    /// reporting stays consistent across every component that reads it.
    pub fn new(process_id: impl Into<String>, demo_mode: bool) -> Self {
        Self {
            process_id: process_id.into(),
            demo_mode,
            started_at: Instant::now(),
        }
    }

    /// The process identifier.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Whether the process is running in demo mode.
    pub fn demo_mode(&self) -> bool {
        self.demo_mode
    }

    /// Wall-clock duration since the context was created.
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn demo_mode_is_carried() {
        let ctx = ProcessContext::new("adam-core-1", true);
        assert_eq!(ctx.process_id(), "adam-core-1");
        assert!(ctx.demo_mode());
    }

    #[test]
    fn uptime_is_monotonic() {
        let ctx = ProcessContext::new("adam-core-1", false);
        let first = ctx.uptime();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = ctx.uptime();
        assert!(second >= first);
    }
}
