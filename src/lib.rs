//! # xwb-broker
//!
//! Client-side protocol engine for the VistA RPC Broker (XWB).
//!
//! Turns a raw, fragment-delimited TCP byte stream into typed RPC calls and
//! responses, manages session lifecycle (connect → sign-on → set-context →
//! ready), and exposes observability for a protocol whose real wire format
//! is only partially reverse-engineered. The binary header layout is
//! explicitly provisional: two header strategies exist side by side behind
//! [`protocol::HeaderStrategy`] and must remain swappable.
//!
//! ## Architecture
//!
//! - **protocol**: pure frame encoding/decoding, incremental assembly, and
//!   the XWB decode state machine
//! - **transport**: real socket vs. deterministic in-memory mock
//! - **session**: lifecycle state machine and RPC dispatch with a
//!   mock-data fallback on timeout
//! - **metrics** / **capture**: counters, histograms, and an optional
//!   redacted capture sink
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xwb_broker::{BrokerCapture, BrokerConfig, BrokerMetrics, BrokerSession};
//!
//! #[tokio::main]
//! async fn main() -> xwb_broker::Result<()> {
//!     let config = BrokerConfig::from_env();
//!     let metrics = Arc::new(BrokerMetrics::new());
//!     let capture = Arc::new(BrokerCapture::new(&config, metrics.clone()));
//!     let session = BrokerSession::new(config, metrics.clone(), capture);
//!
//!     let outcome = session.call("ORWPT LIST", &["DOE".to_string()]).await?;
//!     println!("{} patients", outcome.structured.map_or(0, |s| s.patients.len()));
//!     session.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod transport;

pub use capture::{BrokerCapture, CaptureSnapshot};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use session::{BrokerSession, CallOutcome, SessionState, StructuredResult};
