//! TCP transport implementation

use super::{TransportError, TransportStats, TransportTrait, TransportType};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout
    pub timeout: Duration,
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// TCP transport
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
    stats: Arc<RwLock<TransportStats>>,
    connected_at: Option<Instant>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
            stats: Arc::new(RwLock::new(TransportStats::default())),
            connected_at: None,
        }
    }
}

#[async_trait]
impl TransportTrait for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let stream = tokio::time::timeout(self.config.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(self.config.timeout))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;

        // Frames are tiny; don't let Nagle hold them back
        stream.set_nodelay(true).map_err(TransportError::IoError)?;

        self.stream = Some(stream);
        self.connected_at = Some(Instant::now());
        *self.stats.write() = TransportStats::default();

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        stream.write_all(data).await?;
        stream.flush().await?;

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.packets_sent += 1;

        Ok(data.len())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        match stream.read_exact(buf).await {
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
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut buffer = [0u8; 256];
        let mut discarded = 0;
        loop {
            match stream.try_read(&mut buffer) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => discarded += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::IoError(e)),
            }
        }

        self.stats.write().bytes_discarded += discarded as u64;
        Ok(discarded)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn connection_info(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.read().clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}
