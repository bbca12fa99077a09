use std::time::{Duration, Instant};

use stream::Reading;

/// Bounded FIFO of buffered readings, private to the writer, that tracks
/// when it should be flushed per the flush-trigger contract: size reaches
/// `max_size`, or the oldest buffered reading is older than `max_age`.
pub struct BatchBuffer {
    max_size: usize,
    max_age: Duration,
    readings: Vec<Reading>,
    oldest_enqueued_at: Option<Instant>,
}

impl BatchBuffer {
    /// Creates an empty buffer with the given flush thresholds.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            max_size,
            max_age,
            readings: Vec::with_capacity(max_size),
            oldest_enqueued_at: None,
        }
    }

    /// Appends one reading, preserving enqueue order.
    pub fn push(&mut self, reading: Reading) {
        if self.readings.is_empty() {
            self.oldest_enqueued_at = Some(Instant::now());
        }
        self.readings.push(reading);
    }

    /// Number of readings currently buffered.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether the buffer holds no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Whether a flush should happen now: full, or stale.
    pub fn should_flush(&self) -> bool {
        if self.readings.len() >= self.max_size {
            return true;
        }
        match self.oldest_enqueued_at {
            Some(enqueued_at) => enqueued_at.elapsed() >= self.max_age,
            None => false,
        }
    }

    /// Age of the oldest buffered reading, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.oldest_enqueued_at.map(|t| t.elapsed())
    }

    /// Removes and returns every buffered reading, resetting the buffer to
    /// empty. Ordering is preserved, per the writer's ordering contract.
    pub fn drain(&mut self) -> Vec<Reading> {
        self.oldest_enqueued_at = None;
        std::mem::take(&mut self.readings)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::time::SystemTime;

    use metrics::Quality;

    use super::*;

    fn reading() -> Reading {
        Reading {
            device_id: "line-1".to_string(),
            channel_number: 0,
            timestamp: SystemTime::now(),
            raw_value: 1,
            overflow_offset: 0,
            processed_value: 1.0,
            rate_per_second: None,
            quality: Quality::Good,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn flushes_once_max_size_reached() {
        let mut buffer = BatchBuffer::new(2, Duration::from_secs(60));
        assert!(!buffer.should_flush());
        buffer.push(reading());
        assert!(!buffer.should_flush());
        buffer.push(reading());
        assert!(buffer.should_flush());
    }

    #[test]
    fn flushes_once_oldest_reading_is_stale() {
        let mut buffer = BatchBuffer::new(1000, Duration::from_millis(1));
        buffer.push(reading());
        std::thread::sleep(Duration::from_millis(5));
        assert!(buffer.should_flush());
    }

    #[test]
    fn drain_empties_the_buffer_and_preserves_order() {
        let mut buffer = BatchBuffer::new(10, Duration::from_secs(60));
        let mut first = reading();
        first.channel_number = 1;
        let mut second = reading();
        second.channel_number = 2;
        buffer.push(first);
        buffer.push(second);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].channel_number, 1);
        assert_eq!(drained[1].channel_number, 2);
        assert!(buffer.is_empty());
        assert!(!buffer.should_flush());
    }
}
