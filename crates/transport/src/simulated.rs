use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Error, ModbusTransport, TransportState};

/// A transport that never touches the network: each distinct `start`
/// register owns an incrementing counter that wraps at the width implied
/// by `count` (16-bit for `count == 1`, 32-bit for `count == 2`), low word
/// first. Used behind `--demo-mode` so the rest of the pipeline — and its
/// overflow/rate handling — can be exercised without real hardware.
pub struct SimulatedTransport {
    state: TransportState,
    increment_per_read: u32,
    counters: Mutex<HashMap<u16, u64>>,
}

impl SimulatedTransport {
    /// Creates a simulated transport whose counters advance by
    /// `increment_per_read` on every `read` call.
    pub fn new(increment_per_read: u32) -> Self {
        Self {
            state: TransportState::Disconnected,
            increment_per_read,
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ModbusTransport for SimulatedTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn read(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Error> {
        if self.state != TransportState::Connected {
            return Err(Error::Closed);
        }

        let width: u64 = match count {
            1 => 1 << 16,
            2 => 1 << 32,
            other => {
                return Err(Error::ProtocolError {
                    start,
                    count,
                    message: format!("simulated transport only supports register spans of 1 or 2, got {other}"),
                })
            }
        };

        let mut counters = self.counters.lock().expect("simulated transport counters lock poisoned");
        let value = counters.entry(start).or_insert(0);
        *value = (*value + u64::from(self.increment_per_read)) % width;

        Ok(match count {
            1 => vec![*value as u16],
            2 => vec![(*value & 0xFFFF) as u16, (*value >> 16) as u16],
            _ => unreachable!("validated above"),
        })
    }

    async fn test(&mut self) -> Result<(), Error> {
        if self.state == TransportState::Connected {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    async fn close(&mut self) {
        self.state = TransportState::Disconnected;
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn counter_increments_and_wraps_at_16_bits() {
        let mut transport = SimulatedTransport::new(40000);
        transport.connect().await.unwrap();

        let first = transport.read(100, 1).await.unwrap();
        assert_eq!(first, vec![40000]);

        let second = transport.read(100, 1).await.unwrap();
        assert_eq!(second, vec![14464]); // 80000 % 65536
    }

    #[tokio::test]
    async fn distinct_start_registers_have_independent_counters() {
        let mut transport = SimulatedTransport::new(1);
        transport.connect().await.unwrap();

        let _ = transport.read(100, 1).await.unwrap();
        let second_channel = transport.read(200, 1).await.unwrap();
        assert_eq!(second_channel, vec![1]);
    }

    #[tokio::test]
    async fn read_fails_when_not_connected() {
        let mut transport = SimulatedTransport::new(1);
        assert!(transport.read(100, 1).await.is_err());
    }

    #[test]
    fn preflight_always_succeeds() {
        assert!(SimulatedTransport::default().preflight().is_ok());
    }
}
