//! Transport layer for the UH1 link
//!
//! Supports:
//! - Serial ports (RS-485 adapters, USB-Serial)
//! - Raw TCP connections to serial-over-IP bridges
//!
//! The protocol engine only needs three byte-level primitives from a link:
//! send a whole frame, read an exact number of bytes, and throw away whatever
//! is sitting in the receive buffer.

mod serial;
mod tcp;

pub use serial::{list_ports, SerialConfig, SerialParity, SerialTransport, DEFAULT_BAUD_RATE};
pub use tcp::{TcpConfig, TcpTransport};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport type enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    /// Serial port connection
    Serial(SerialConfig),
    /// Raw TCP connection
    Tcp(TcpConfig),
}

impl Transport {
    /// Parse a link address
    ///
    /// Accepted forms: `host:port`, `socket://host:port`, `tcp://host:port`,
    /// or a serial device path with an optional `@baud` suffix
    /// (`/dev/ttyUSB0@4800`, `COM3`).
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "empty link address".to_string(),
            ));
        }

        for scheme in ["socket://", "tcp://"] {
            if let Some(rest) = address.strip_prefix(scheme) {
                return parse_host_port(rest).map(Transport::Tcp);
            }
        }

        if is_serial_path(address) {
            let (port, baud) = match address.rsplit_once('@') {
                Some((port, baud)) => {
                    let baud = baud.parse::<u32>().map_err(|_| {
                        TransportError::InvalidConfiguration(format!("invalid baud rate: {baud}"))
                    })?;
                    (port, baud)
                }
                None => (address, DEFAULT_BAUD_RATE),
            };
            return Ok(Transport::Serial(SerialConfig::new(port, baud)));
        }

        parse_host_port(address).map(Transport::Tcp)
    }

    /// Override the connect timeout
    #[must_use]
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        match self {
            Transport::Tcp(cfg) => Transport::Tcp(cfg.timeout(timeout)),
            other => other,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Serial(cfg) => write!(f, "{}@{}", cfg.port, cfg.baud_rate),
            Transport::Tcp(cfg) => write!(f, "{}:{}", cfg.host, cfg.port),
        }
    }
}

fn is_serial_path(address: &str) -> bool {
    address.starts_with('/') || address.to_uppercase().starts_with("COM")
}

fn parse_host_port(address: &str) -> Result<TcpConfig, TransportError> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        TransportError::InvalidConfiguration(format!("expected host:port, got {address}"))
    })?;
    if host.is_empty() {
        return Err(TransportError::InvalidConfiguration(format!(
            "missing host in {address}"
        )));
    }
    let port = port.parse::<u16>().map_err(|_| {
        TransportError::InvalidConfiguration(format!("invalid port in {address}"))
    })?;
    Ok(TcpConfig::new(host, port))
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Serial port
    Serial,
    /// Raw TCP
    Tcp,
    /// In-process virtual bus
    Virtual,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Tcp => write!(f, "TCP"),
            Self::Virtual => write!(f, "Virtual"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Peer closed the connection
    #[error("Disconnected")]
    Disconnected,
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Frames sent
    pub packets_sent: u64,
    /// Bytes thrown away while resynchronising
    pub bytes_discarded: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Byte link to a UH1 bus
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportTrait: Send + Sync {
    /// Connect to the target
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Disconnect from the target
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send a whole frame
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Fill `buf` completely, waiting as long as it takes
    ///
    /// Callers bound the wait with a timeout; a cancelled read may have
    /// consumed part of a frame, so the input must be cleared afterwards.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Discard buffered input, returning how many bytes were dropped
    async fn clear_input(&mut self) -> Result<usize, TransportError>;

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}

/// Create a transport instance from configuration
pub fn create_transport(config: Transport) -> Box<dyn TransportTrait> {
    match config {
        Transport::Serial(cfg) => Box::new(SerialTransport::new(cfg)),
        Transport::Tcp(cfg) => Box::new(TcpTransport::new(cfg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_forms() {
        for address in ["192.168.1.50:1024", "socket://192.168.1.50:1024", "tcp://192.168.1.50:1024"] {
            match Transport::parse(address).unwrap() {
                Transport::Tcp(cfg) => {
                    assert_eq!(cfg.host, "192.168.1.50");
                    assert_eq!(cfg.port, 1024);
                }
                other => panic!("{address} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_serial_forms() {
        match Transport::parse("/dev/ttyUSB0").unwrap() {
            Transport::Serial(cfg) => {
                assert_eq!(cfg.port, "/dev/ttyUSB0");
                assert_eq!(cfg.baud_rate, DEFAULT_BAUD_RATE);
            }
            other => panic!("unexpected {other:?}"),
        }

        match Transport::parse("COM3@9600").unwrap() {
            Transport::Serial(cfg) => {
                assert_eq!(cfg.port, "COM3");
                assert_eq!(cfg.baud_rate, 9600);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Transport::parse("").is_err());
        assert!(Transport::parse("hub.local").is_err());
        assert!(Transport::parse("hub.local:http").is_err());
        assert!(Transport::parse(":1024").is_err());
        assert!(Transport::parse("/dev/ttyS0@fast").is_err());
    }

    #[test]
    fn test_display() {
        let transport = Transport::parse("tcp://hub:1024").unwrap();
        assert_eq!(transport.to_string(), "hub:1024");
        let transport = Transport::parse("/dev/ttyS1@4800").unwrap();
        assert_eq!(transport.to_string(), "/dev/ttyS1@4800");
    }
}
