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

//! Modbus/TCP transport (C2): one connection to one device, function code
//! 0x03 (read holding registers). Retry and reconnect policy live one
//! layer up, in the device worker — this crate only ever attempts a
//! single read per call, bounded by a deadline.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_modbus::client::tcp;
use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext};

mod simulated;

pub use simulated::SimulatedTransport;

/// Connection state, mirroring the state machine in the transport
/// contract: any failure drops straight back to `Disconnected`, leaving
/// reconnection to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No socket open.
    Disconnected,
    /// `connect` is in flight.
    Connecting,
    /// A socket is open and the last operation (if any) succeeded.
    Connected,
}

/// Errors surfaced by a transport operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `connect` did not complete within the deadline.
    #[error("connect to {host}:{port} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The remote end actively refused the connection.
    #[error("connect to {host}:{port} refused: {source}")]
    ConnectRefused {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read did not complete within the deadline.
    #[error("read of {count} register(s) at {start} timed out after {timeout_ms}ms")]
    Timeout {
        /// Start register address.
        start: u16,
        /// Number of registers requested.
        count: u16,
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The device returned a malformed or exception Modbus response.
    #[error("protocol error reading {count} register(s) at {start}: {message}")]
    ProtocolError {
        /// Start register address.
        start: u16,
        /// Number of registers requested.
        count: u16,
        /// Description of the malformed response.
        message: String,
    },

    /// A transport-level I/O error, distinct from a protocol exception.
    #[error("io error: {source}")]
    IoError {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The transport was not connected when the operation was attempted.
    #[error("transport is closed")]
    Closed,

    /// A configured address or parameter could not be represented in the
    /// underlying protocol (e.g. a host/port that doesn't parse).
    #[error("invalid endpoint {host}:{port}")]
    InvalidEndpoint {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
}

/// One connection to one Modbus/TCP device.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Synchronous sanity check of the transport's target, run before a
    /// worker is spawned for it so a malformed endpoint fails the calling
    /// pool operation immediately instead of a connected worker later
    /// discovering it can never connect. Transports with nothing to check
    /// upfront (e.g. [`SimulatedTransport`]) accept the default `Ok(())`.
    fn preflight(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Opens the connection. Completes within `timeout_ms` or fails with
    /// `ConnectTimeout`/`ConnectRefused`.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Reads `count` contiguous holding registers starting at `start`.
    async fn read(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Error>;

    /// Issues a minimal read against a configured probe register;
    /// success/failure only, used for health probing independent of the
    /// main poll path.
    async fn test(&mut self) -> Result<(), Error>;

    /// Idempotent. Releases the socket if one is open.
    async fn close(&mut self);

    /// The transport's current connection state.
    fn state(&self) -> TransportState;
}

/// A real Modbus/TCP transport backed by `tokio-modbus`.
pub struct TcpModbusTransport {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    probe_register: u16,
    state: TransportState,
    context: Option<ModbusContext>,
}

impl TcpModbusTransport {
    /// Creates a transport for one device. `probe_register` is read (as a
    /// single register) by `test`.
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration, probe_register: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
            probe_register,
            state: TransportState::Disconnected,
            context: None,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| Error::InvalidEndpoint {
                host: self.host.clone(),
                port: self.port,
            })
    }
}

#[async_trait]
impl ModbusTransport for TcpModbusTransport {
    fn preflight(&self) -> Result<(), Error> {
        self.socket_addr().map(|_| ())
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.state = TransportState::Connecting;
        let addr = self.socket_addr()?;

        let connect = tokio_modbus::client::tcp::connect(addr);
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(mut context)) => {
                context.set_slave(Slave(self.unit_id));
                self.context = Some(context);
                self.state = TransportState::Connected;
                tracing::info!(host = %self.host, port = self.port, "modbus transport connected");
                Ok(())
            }
            Ok(Err(source)) => {
                self.state = TransportState::Disconnected;
                Err(Error::ConnectRefused {
                    host: self.host.clone(),
                    port: self.port,
                    source,
                })
            }
            Err(_) => {
                self.state = TransportState::Disconnected;
                Err(Error::ConnectTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn read(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Error> {
        let context = self.context.as_mut().ok_or(Error::Closed)?;
        let request = context.read_holding_registers(start, count);

        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(Ok(values))) => Ok(values),
            Ok(Ok(Err(exception))) => {
                self.state = TransportState::Disconnected;
                Err(Error::ProtocolError {
                    start,
                    count,
                    message: exception.to_string(),
                })
            }
            Ok(Err(source)) => {
                self.state = TransportState::Disconnected;
                Err(Error::IoError { source })
            }
            Err(_) => {
                self.state = TransportState::Disconnected;
                Err(Error::Timeout {
                    start,
                    count,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn test(&mut self) -> Result<(), Error> {
        let probe_register = self.probe_register;
        self.read(probe_register, 1).await.map(|_| ())
    }

    async fn close(&mut self) {
        if self.context.take().is_some() {
            tracing::debug!(host = %self.host, port = self.port, "modbus transport closed");
        }
        self.state = TransportState::Disconnected;
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let transport = TcpModbusTransport::new("127.0.0.1", 502, 1, Duration::from_millis(500), 0);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[test]
    fn invalid_host_is_rejected_before_connecting() {
        let transport = TcpModbusTransport::new("not a host", 502, 1, Duration::from_millis(500), 0);
        assert!(transport.socket_addr().is_err());
    }

    #[test]
    fn preflight_rejects_an_unparsable_endpoint() {
        let transport = TcpModbusTransport::new("not a host", 502, 1, Duration::from_millis(500), 0);
        assert!(matches!(transport.preflight(), Err(Error::InvalidEndpoint { .. })));
    }

    #[test]
    fn preflight_accepts_a_well_formed_endpoint() {
        let transport = TcpModbusTransport::new("127.0.0.1", 502, 1, Duration::from_millis(500), 0);
        assert!(transport.preflight().is_ok());
    }
}
