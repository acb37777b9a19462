//! Deterministic in-memory mock transport.
//!
//! Simulates fixed latency and serves canned response tables keyed by RPC
//! name, for tests and offline development. Responses are framed in the
//! synthetic length-prefixed format so the normal decode path is exercised.
//! A response resolves a pending reader immediately or queues until the
//! next `read`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{frame_response_lines, RPC_NAME_WIDTH, XWB_HEADER_LEN};
use crate::transport::BrokerTransport;

/// Default simulated latency.
pub const DEFAULT_MOCK_LATENCY: Duration = Duration::from_millis(8);

/// Canned patient-list sample shared with the session fallback path.
pub const SAMPLE_PATIENT_LINES: [&str; 4] = [
    "100^DOE,JOHN^1234^M^01/12/1965",
    "101^DOE,JANE^2345^F^07/03/1972",
    "102^ALVAREZ,CARLOS^3456^M^11/22/1959",
    "103^JOHNSON,MARY^4567^F^05/09/1980",
];

/// In-memory loopback transport with canned responses.
pub struct MockTransport {
    latency: Duration,
    connected: bool,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MockTransport {
    /// Create a mock with the default latency.
    pub fn new() -> Self {
        Self::with_latency(DEFAULT_MOCK_LATENCY)
    }

    /// Create a mock with a custom simulated latency.
    pub fn with_latency(latency: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            latency,
            connected: false,
            tx,
            rx,
        }
    }

    fn respond(rpc: &str, filter: Option<&str>) -> Vec<String> {
        let canned: Vec<String> = match rpc {
            "XUS SIGNON SETUP" => vec!["#SIGNON_SETUP".into(), "END".into()],
            "XUS AV CODE" => vec!["#AV_OK".into(), "END".into()],
            "XWB SET CONTEXT" => vec!["1".into(), "END".into()],
            "ORWPT LIST" | "ORWPT LIST ALL" => {
                let needle = filter.unwrap_or("").to_lowercase();
                let mut lines: Vec<String> = SAMPLE_PATIENT_LINES
                    .iter()
                    .filter(|l| needle.is_empty() || l.to_lowercase().contains(&needle))
                    .map(|l| l.to_string())
                    .collect();
                lines.push("END".into());
                lines
            }
            _ => vec!["#MOCK".into(), "END".into()],
        };
        canned
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let (rpc, params) = parse_synthetic_frame(frame)
            .unwrap_or_else(|| ("UNKNOWN".to_string(), Vec::new()));
        let lines = Self::respond(&rpc, params.first().map(String::as_str));
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let framed = frame_response_lines(&refs);

        tokio::time::sleep(self.latency).await;
        // Receiver lives on self; the send can only fail after destroy
        let _ = self.tx.send(framed);
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    fn destroy(&mut self) {
        self.connected = false;
        while self.rx.try_recv().is_ok() {}
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Recover the RPC name and parameters from a synthetic request frame.
///
/// Accepts the raw frame or its length-prefixed envelope. Returns `None`
/// when the buffer is not a recognizable synthetic frame.
fn parse_synthetic_frame(frame: &[u8]) -> Option<(String, Vec<String>)> {
    // Strip the optional [u32 BE length] envelope
    let frame = if frame.len() > 4 {
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared == frame.len() - 4 {
            &frame[4..]
        } else {
            frame
        }
    } else {
        frame
    };

    if frame.len() < XWB_HEADER_LEN || frame[0] != 0x00 || frame[1] != 0x00 {
        return None;
    }
    let declared = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let payload = frame.get(XWB_HEADER_LEN..XWB_HEADER_LEN + declared)?;
    if payload.len() < RPC_NAME_WIDTH {
        return None;
    }

    let name = String::from_utf8_lossy(&payload[..RPC_NAME_WIDTH])
        .trim_end()
        .to_string();

    let mut params = Vec::new();
    let mut rest = &payload[RPC_NAME_WIDTH..];
    while rest.len() >= 6 {
        let index: usize = std::str::from_utf8(&rest[..3]).ok()?.parse().ok()?;
        let length: usize = std::str::from_utf8(&rest[3..6]).ok()?.parse().ok()?;
        let value = rest.get(6..6 + length)?;
        if rest.get(6 + length) != Some(&b'f') {
            return None;
        }
        if params.len() <= index {
            params.resize(index + 1, String::new());
        }
        params[index] = String::from_utf8_lossy(value).into_owned();
        rest = &rest[6 + length + 1..];
    }

    Some((name, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_rpc, decode_length_prefixed, EncodeOptions};

    fn encode(rpc: &str, params: &[&str]) -> Bytes {
        let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        encode_rpc(
            rpc,
            &params,
            EncodeOptions {
                experimental_length_prefix: true,
            },
        )
        .length_prefixed
        .unwrap()
    }

    #[tokio::test]
    async fn test_signon_canned_response() {
        let mut mock = MockTransport::with_latency(Duration::from_millis(1));
        mock.connect().await.unwrap();
        assert!(mock.is_connected());

        mock.send(&encode("XUS SIGNON SETUP", &[])).await.unwrap();
        let buf = mock.read(Duration::from_millis(100)).await.unwrap().unwrap();
        let decoded = decode_length_prefixed(&buf);
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["#SIGNON_SETUP"]);
    }

    #[tokio::test]
    async fn test_patient_list_with_filter() {
        let mut mock = MockTransport::with_latency(Duration::from_millis(1));
        mock.connect().await.unwrap();

        mock.send(&encode("ORWPT LIST ALL", &["doe"])).await.unwrap();
        let buf = mock.read(Duration::from_millis(100)).await.unwrap().unwrap();
        let decoded = decode_length_prefixed(&buf);
        assert!(decoded.ok);
        assert_eq!(decoded.lines.len(), 2);
        assert!(decoded.lines.iter().all(|l| l.contains("DOE")));
    }

    #[tokio::test]
    async fn test_unknown_rpc_gets_mock_marker() {
        let mut mock = MockTransport::with_latency(Duration::from_millis(1));
        mock.connect().await.unwrap();

        mock.send(&encode("XYZ UNKNOWN", &[])).await.unwrap();
        let buf = mock.read(Duration::from_millis(100)).await.unwrap().unwrap();
        let decoded = decode_length_prefixed(&buf);
        assert_eq!(decoded.lines, vec!["#MOCK"]);
    }

    #[tokio::test]
    async fn test_read_without_response_times_out() {
        let mut mock = MockTransport::new();
        mock.connect().await.unwrap();
        let result = mock.read(Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_queued_response_survives_until_read() {
        let mut mock = MockTransport::with_latency(Duration::from_millis(1));
        mock.connect().await.unwrap();
        mock.send(&encode("XUS AV CODE", &["AC^VC"])).await.unwrap();

        // No reader was waiting; the response is queued
        let buf = mock.read(Duration::from_millis(50)).await.unwrap().unwrap();
        let decoded = decode_length_prefixed(&buf);
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["#AV_OK"]);
    }

    #[tokio::test]
    async fn test_destroy_clears_queue() {
        let mut mock = MockTransport::with_latency(Duration::from_millis(1));
        mock.connect().await.unwrap();
        mock.send(&encode("XWB SET CONTEXT", &["OR CPRS GUI CHART"]))
            .await
            .unwrap();

        mock.destroy();
        assert!(!mock.is_connected());
        let result = mock.read(Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_parse_synthetic_frame_recovers_name_and_params() {
        let frame = encode("ORWPT LIST ALL", &["smith", "42"]);
        let (name, params) = parse_synthetic_frame(&frame).unwrap();
        assert_eq!(name, "ORWPT LIST ALL");
        assert_eq!(params, vec!["smith", "42"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_synthetic_frame(b"garbage").is_none());
    }
}
