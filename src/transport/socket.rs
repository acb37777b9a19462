//! Live TCP transport for the broker socket.
//!
//! Wraps a tokio `TcpStream` with a connect timeout and per-read timeouts.
//! Inbound chunks are counted, fed through an optional frame assembler for
//! assembly metrics, and offered to the capture sink before being handed to
//! the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::capture::BrokerCapture;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::metrics::BrokerMetrics;
use crate::protocol::FrameAssembler;
use crate::transport::BrokerTransport;

/// Read buffer size for one socket read.
const READ_BUF_SIZE: usize = 64 * 1024;

/// TCP transport with connect and per-read timeouts.
pub struct SocketTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    length_prefix: bool,
    stream: Option<TcpStream>,
    assembler: Option<FrameAssembler>,
    metrics: Arc<BrokerMetrics>,
    capture: Arc<BrokerCapture>,
}

impl SocketTransport {
    /// Create an unconnected transport from the configuration.
    pub fn new(
        config: &BrokerConfig,
        metrics: Arc<BrokerMetrics>,
        capture: Arc<BrokerCapture>,
    ) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout,
            length_prefix: config.length_prefix,
            stream: None,
            assembler: None,
            metrics,
            capture,
        }
    }
}

#[async_trait]
impl BrokerTransport for SocketTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let addr = (self.host.as_str(), self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BrokerError::ConnectTimeout(self.connect_timeout.as_millis() as u64))??;
        self.stream = Some(stream);
        if self.length_prefix {
            self.assembler = Some(FrameAssembler::new());
        }
        tracing::info!(host = %self.host, port = self.port, "broker socket connected");
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        let mut buf = vec![0u8; READ_BUF_SIZE];

        let n = match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(Ok(0)) => return Err(BrokerError::ConnectionClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(BrokerError::Io(e)),
        };
        let chunk = Bytes::copy_from_slice(&buf[..n]);

        self.metrics.record_frame_chunk();
        if let Some(assembler) = self.assembler.as_mut() {
            if let Some(result) = assembler.push(&chunk) {
                if result.packet.is_some() {
                    self.metrics.record_frame_complete();
                }
                if let Some(code) = result.error {
                    self.metrics.record_frame_error(code.as_str());
                }
            }
        }
        self.capture.record_greeting(&chunk);
        self.capture.record_frame_chunk(&chunk);

        Ok(Some(chunk))
    }

    fn destroy(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("broker socket destroyed");
        }
        self.assembler = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
