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

//! Structured cancellation and paced-loop ticking shared by every
//! long-running task: device workers, the batched writer's flush
//! scheduler, and the DLQ re-drain task.
//!
//! A [`Signal`] is either a `Tick` (raised by a configured interval timer)
//! or `Shutdown` (raised once the owning [`ShutdownToken`] is cancelled). A
//! [`TickReceiver`] races the two so a task never needs to poll the
//! cancellation token separately from its own clock.

use std::time::{Duration, Instant};

use futures::{
    future::{select, Either},
    pin_mut,
};
use tokio_util::sync::CancellationToken;

/// What a [`TickReceiver`] produced on its latest `recv`.
#[derive(Debug)]
#[non_exhaustive]
pub enum Signal {
    /// The interval elapsed; time to do the next unit of periodic work.
    Tick {
        /// When the tick fired.
        instant: Instant,
    },
    /// The owning [`ShutdownToken`] was cancelled; the task should wind
    /// down cooperatively and exit.
    Shutdown,
}

/// A cooperative cancellation handle. Cloning shares the same underlying
/// signal; [`ShutdownToken::child_token`] creates one that is cancelled
/// whenever its parent is, without affecting the parent in reverse —
/// mirroring the supervisor-to-worker propagation described for the pool.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(CancellationToken);

impl ShutdownToken {
    /// Creates a new, independent token.
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Creates a token that is cancelled whenever `self` is cancelled, but
    /// can also be cancelled on its own without affecting `self`.
    pub fn child_token(&self) -> Self {
        Self(self.0.child_token())
    }

    /// Signals cancellation to this token and every descendant created by
    /// `child_token`.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// Whether cancellation has already been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once this token is cancelled.
    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}

/// Races a fixed-period interval timer against a [`ShutdownToken`], so a
/// paced loop can `select` on one future instead of two.
pub struct TickReceiver {
    interval: tokio::time::Interval,
    shutdown: ShutdownToken,
}

impl TickReceiver {
    /// Creates a receiver that ticks every `period`, starting one period
    /// from now (the first `recv` does not fire immediately). A tick that
    /// overruns its period skips forward to the next scheduled instant
    /// rather than queuing up a burst of catch-up ticks.
    pub fn new(period: Duration, shutdown: ShutdownToken) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Self { interval, shutdown }
    }

    /// Waits for the next tick or for shutdown, whichever comes first. A
    /// tick that fires after shutdown has already been signalled still
    /// returns `Signal::Shutdown`, since `select` evaluates both futures
    /// each call and cancellation, once true, stays true.
    pub async fn recv(&mut self) -> Signal {
        let tick = self.interval.tick();
        let cancelled = self.shutdown.cancelled();
        pin_mut!(tick, cancelled);

        match select(tick, cancelled).await {
            Either::Left((instant, _)) => Signal::Tick {
                instant: instant.into_std(),
            },
            Either::Right(_) => Signal::Shutdown,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ticks_before_shutdown() {
        let shutdown = ShutdownToken::new();
        let mut ticks = TickReceiver::new(Duration::from_millis(5), shutdown.clone());

        match ticks.recv().await {
            Signal::Tick { .. } => {}
            Signal::Shutdown => panic!("expected a tick before shutdown"),
        }
    }

    #[tokio::test]
    async fn shutdown_wins_once_cancelled() {
        let shutdown = ShutdownToken::new();
        let mut ticks = TickReceiver::new(Duration::from_secs(60), shutdown.clone());
        shutdown.cancel();

        match ticks.recv().await {
            Signal::Shutdown => {}
            Signal::Tick { .. } => panic!("expected shutdown, not a tick"),
        }
    }

    #[test]
    fn child_token_cancelled_by_parent() {
        let parent = ShutdownToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_affect_parent() {
        let parent = ShutdownToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
