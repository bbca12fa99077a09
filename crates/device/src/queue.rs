use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::RawFrame;

/// A bounded frame queue with oldest-drop backpressure, keyed by channel:
/// when full, the oldest buffered frame *for the incoming frame's
/// channel* is evicted, not necessarily the oldest frame overall. Neither
/// `flume` nor `tokio::sync::mpsc` expose a way for the sending side to
/// reach back into the channel and evict a specific buffered item, so this
/// is a small hand-rolled ring buffer behind one `Mutex`, matching the
/// "guarded by a single short critical section" allowance for shared
/// mutable state.
struct Shared {
    capacity: usize,
    buffer: Mutex<VecDeque<RawFrame>>,
    notify: Notify,
}

/// Creates a bound frame queue with room for `capacity` frames.
pub struct FrameQueue;

impl FrameQueue {
    /// Creates the sender/receiver pair for one device worker's emission
    /// queue. `capacity` is `8 * channel_count` per the device worker
    /// contract.
    pub fn new(capacity: usize) -> (FrameQueueSender, FrameQueueReceiver) {
        let shared = Arc::new(Shared {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        });

        (
            FrameQueueSender { shared: shared.clone() },
            FrameQueueReceiver { shared },
        )
    }
}

/// The producing half, held by the device worker.
#[derive(Clone)]
pub struct FrameQueueSender {
    shared: Arc<Shared>,
}

impl FrameQueueSender {
    /// Pushes a frame. Returns `true` if a buffered frame had to be
    /// dropped to make room.
    pub fn push(&self, frame: RawFrame) -> bool {
        let mut buffer = self.shared.buffer.lock().expect("frame queue lock poisoned");

        let dropped = if buffer.len() >= self.shared.capacity {
            let same_channel_index = buffer
                .iter()
                .position(|buffered| buffered.device_id == frame.device_id && buffered.channel_number == frame.channel_number);
            match same_channel_index {
                Some(index) => {
                    let _ = buffer.remove(index);
                }
                None => {
                    let _ = buffer.pop_front();
                }
            }
            true
        } else {
            false
        };

        buffer.push_back(frame);
        drop(buffer);
        self.shared.notify.notify_one();
        dropped
    }
}

/// The consuming half, held by the stream processor.
pub struct FrameQueueReceiver {
    shared: Arc<Shared>,
}

impl FrameQueueReceiver {
    /// Waits for and returns the next frame in arrival order.
    pub async fn recv(&mut self) -> RawFrame {
        loop {
            {
                let mut buffer = self.shared.buffer.lock().expect("frame queue lock poisoned");
                if let Some(frame) = buffer.pop_front() {
                    return frame;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Current number of buffered frames, used for queue-depth metrics.
    pub fn len(&self) -> usize {
        self.shared.buffer.lock().expect("frame queue lock poisoned").len()
    }

    /// Whether the queue currently has no buffered frames.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant, SystemTime};

    use super::*;
    use crate::{AcquiredAt, RawFrameCause};

    fn frame(channel_number: u16, tag: u16) -> RawFrame {
        RawFrame {
            device_id: "d1".to_string(),
            channel_number,
            registers: vec![tag],
            acquired_at: AcquiredAt {
                monotonic: Instant::now(),
                wall_clock: SystemTime::now(),
            },
            acquisition_duration: Duration::from_millis(1),
            cause: RawFrameCause::Ok,
        }
    }

    #[tokio::test]
    async fn frames_are_received_in_order() {
        let (sender, mut receiver) = FrameQueue::new(4);
        assert!(!sender.push(frame(0, 1)));
        assert!(!sender.push(frame(0, 2)));

        assert_eq!(receiver.recv().await.registers, vec![1]);
        assert_eq!(receiver.recv().await.registers, vec![2]);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_frame_of_the_same_channel() {
        let (sender, mut receiver) = FrameQueue::new(2);
        assert!(!sender.push(frame(0, 1)));
        assert!(!sender.push(frame(1, 10)));
        assert!(sender.push(frame(0, 2)));

        let first = receiver.recv().await;
        assert_eq!(first.channel_number, 1);
        assert_eq!(first.registers, vec![10]);

        let second = receiver.recv().await;
        assert_eq!(second.channel_number, 0);
        assert_eq!(second.registers, vec![2]);
    }
}
