//! Transport module - abstraction over a live broker socket vs. a
//! deterministic in-memory mock.
//!
//! A read timeout is not an error: `read` resolves to `Ok(None)` and the
//! caller decides the fallback behavior.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

mod mock;
mod socket;

pub use mock::{MockTransport, DEFAULT_MOCK_LATENCY, SAMPLE_PATIENT_LINES};
pub use socket::SocketTransport;

/// Async transport owned exclusively by one session.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Establish the connection. A no-op when already connected.
    async fn connect(&mut self) -> Result<()>;

    /// Send one frame.
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Await one inbound buffer for up to `timeout`.
    ///
    /// Resolves to `Ok(None)` on timeout (a defined "no data" outcome).
    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Release the connection. Safe to call multiple times.
    fn destroy(&mut self);

    /// Whether the transport currently holds a live connection.
    fn is_connected(&self) -> bool;
}
