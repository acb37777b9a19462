//! Error types for the broker engine.
//!
//! Only transport and session lifecycle failures surface as `Err` values.
//! Framing and state-machine failures are typed result *kinds* carried inside
//! decode results (see [`crate::protocol::FrameErrorCode`]), so callers can
//! branch on them without error handling.

use thiserror::Error;

/// Main error type for all broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (capture artifacts only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connect attempt did not complete within the configured timeout.
    #[error("broker connect timeout after {0} ms")]
    ConnectTimeout(u64),

    /// `send`/`read` called before `connect`.
    #[error("broker transport not connected")]
    NotConnected,

    /// Peer closed the connection (EOF on read).
    #[error("broker connection closed")]
    ConnectionClosed,

    /// Session was destroyed; it will not reconnect.
    #[error("broker session closed")]
    Closed,
}

/// Result type alias using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;
