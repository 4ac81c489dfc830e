//! Serial port transport implementation
//!
//! The UH1 hub talks RS-485 at 4800 baud, 8 data bits, no parity, one stop bit.

use super::{TransportError, TransportStats, TransportTrait, TransportType};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};

/// Line speed used by the UH1 hub
pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity: {other}")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
}

impl SerialConfig {
    /// Create a new serial configuration, 8N1
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", DEFAULT_BAUD_RATE)
    }
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
    stats: Arc<RwLock<TransportStats>>,
    connected_at: Option<Instant>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            stats: Arc::new(RwLock::new(TransportStats::default())),
            connected_at: None,
        }
    }

    fn open_error(&self, e: &tokio_serial::Error) -> TransportError {
        match e.kind() {
            tokio_serial::ErrorKind::NoDevice => TransportError::PortNotFound(self.config.port.clone()),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                TransportError::PermissionDenied(self.config.port.clone())
            }
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                TransportError::PortNotFound(self.config.port.clone())
            }
            _ => TransportError::ConnectionFailed(format!("{}: {e}", self.config.port)),
        }
    }
}

fn io_error(e: tokio_serial::Error) -> TransportError {
    TransportError::IoError(e.into())
}

#[async_trait]
impl TransportTrait for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| self.open_error(&e))?;

        self.port = Some(port);
        self.connected_at = Some(Instant::now());
        *self.stats.write() = TransportStats::default();

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.port = None;
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        port.write_all(data).await?;
        port.flush().await?;

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.packets_sent += 1;

        Ok(data.len())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        match port.read_exact(buf).await {
            Ok(_) => {
                self.stats.write().bytes_received += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::IoError(e)),
        }
    }

    async fn clear_input(&mut self) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let pending = port.bytes_to_read().map_err(io_error)?;
        port.clear(ClearBuffer::Input).map_err(io_error)?;

        let discarded = pending as usize;
        self.stats.write().bytes_discarded += discarded as u64;
        Ok(discarded)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Serial
    }

    fn connection_info(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.config.stop_bits,
        )
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.read().clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_uh1_line_settings() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 4800);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.parity, SerialParity::None);
    }

    #[test]
    fn test_connection_info() {
        let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB1", 4800));
        assert_eq!(transport.connection_info(), "/dev/ttyUSB1 @ 4800 baud (8N1)");
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_parity_parsing() {
        assert_eq!("E".parse::<SerialParity>(), Ok(SerialParity::Even));
        assert_eq!("none".parse::<SerialParity>(), Ok(SerialParity::None));
        assert!("mark".parse::<SerialParity>().is_err());
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_open() {
        let mut transport =
            SerialTransport::new(SerialConfig::new("/dev/heatmiser-does-not-exist", 4800));
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
    }
}
