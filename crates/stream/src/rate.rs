use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Retain at most this many samples...
const MAX_SAMPLES: usize = 32;
/// ...or this much history, whichever is smaller.
const MAX_SPAN: Duration = Duration::from_secs(60);
/// Minimum span before a rate is reported at all, to avoid wildly noisy
/// estimates from two samples a few milliseconds apart.
const MIN_SPAN_FOR_RATE: Duration = Duration::from_secs(1);

/// Bounded ring of `(acquired_at, adjusted_raw)` samples used to compute
/// an instantaneous rate without unbounded memory growth.
#[derive(Debug, Default)]
pub(crate) struct RateWindow {
    samples: VecDeque<(Instant, i64)>,
}

impl RateWindow {
    pub(crate) fn push(&mut self, instant: Instant, adjusted: i64) {
        self.samples.push_back((instant, adjusted));

        while self.samples.len() > MAX_SAMPLES {
            let _ = self.samples.pop_front();
        }

        while let Some(&(oldest, _)) = self.samples.front() {
            if instant.saturating_duration_since(oldest) > MAX_SPAN {
                let _ = self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn rate(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }

        let &(oldest_instant, oldest_value) = self.samples.front().expect("checked len >= 2");
        let &(newest_instant, newest_value) = self.samples.back().expect("checked len >= 2");

        let span = newest_instant.saturating_duration_since(oldest_instant);
        if span < MIN_SPAN_FOR_RATE {
            return None;
        }

        Some((newest_value - oldest_value) as f64 / span.as_secs_f64())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fewer_than_two_samples_yields_no_rate() {
        let mut window = RateWindow::default();
        assert_eq!(window.rate(), None);
        window.push(Instant::now(), 10);
        assert_eq!(window.rate(), None);
    }

    #[test]
    fn span_under_one_second_yields_no_rate() {
        let mut window = RateWindow::default();
        let t0 = Instant::now();
        window.push(t0, 500);
        window.push(t0 + Duration::from_millis(200), 560);
        assert_eq!(window.rate(), None);
    }

    #[test]
    fn rate_is_delta_over_span() {
        let mut window = RateWindow::default();
        let t0 = Instant::now();
        window.push(t0, 500);
        window.push(t0 + Duration::from_secs(1), 560);
        assert_eq!(window.rate(), Some(60.0));
    }

    #[test]
    fn window_never_exceeds_max_samples() {
        let mut window = RateWindow::default();
        let t0 = Instant::now();
        for i in 0..64 {
            window.push(t0 + Duration::from_secs(i), i as i64);
        }
        assert_eq!(window.samples.len(), MAX_SAMPLES);
    }
}
