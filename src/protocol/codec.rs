//! Frame codec seam between the session and the wire formats.
//!
//! The session encodes and decodes through [`FrameCodec`] so the synthetic
//! scaffolding format and the provisional XWB binary format stay
//! interchangeable while the authentic protocol is reverse-engineered.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::json;

use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;
use crate::protocol::framing::{
    decode_length_prefixed, decode_rpc_response, decode_xwb, encode_rpc, EncodeOptions,
    EncodedRpcPacket, FrameKind,
};
use crate::protocol::xwb_state::XwbStateMachineOptions;

/// Decoded body lines as consumed by the session layer.
#[derive(Debug, Clone)]
pub struct DecodedLines {
    pub ok: bool,
    pub lines: Vec<String>,
}

/// Pluggable wire-format codec.
pub trait FrameCodec: Send + Sync {
    /// Encode an RPC call into an outbound packet.
    fn encode(&self, rpc: &str, params: &[String]) -> EncodedRpcPacket;
    /// Decode an inbound buffer; `used_length_prefix` reflects how the
    /// request was framed.
    fn decode(&self, buffer: &[u8], used_length_prefix: bool) -> DecodedLines;
}

/// Codec for the synthetic formats (plain and length-prefixed).
pub struct SyntheticCodec {
    use_length_prefix: bool,
}

impl SyntheticCodec {
    pub fn new(use_length_prefix: bool) -> Self {
        Self { use_length_prefix }
    }
}

impl FrameCodec for SyntheticCodec {
    fn encode(&self, rpc: &str, params: &[String]) -> EncodedRpcPacket {
        encode_rpc(
            rpc,
            params,
            EncodeOptions {
                experimental_length_prefix: self.use_length_prefix,
            },
        )
    }

    fn decode(&self, buffer: &[u8], used_length_prefix: bool) -> DecodedLines {
        let decoded = if used_length_prefix {
            decode_length_prefixed(buffer)
        } else {
            decode_rpc_response(buffer)
        };
        DecodedLines {
            ok: decoded.ok,
            lines: decoded.lines,
        }
    }
}

/// Provisional XWB binary codec.
///
/// Wraps the synthetic request bytes in the provisional header
/// `[0x01][u16 BE length]` so higher layers stay unchanged while the real
/// framing is pinned down.
pub struct XwbCodec {
    real_decode: bool,
    machine_opts: XwbStateMachineOptions,
    metrics: Arc<BrokerMetrics>,
}

impl XwbCodec {
    pub fn new(
        real_decode: bool,
        machine_opts: XwbStateMachineOptions,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            real_decode,
            machine_opts,
            metrics,
        }
    }
}

impl FrameCodec for XwbCodec {
    fn encode(&self, rpc: &str, params: &[String]) -> EncodedRpcPacket {
        let base = encode_rpc(rpc, params, EncodeOptions::default());
        let payload = base.raw.clone();

        let mut framed = BytesMut::with_capacity(3 + payload.len());
        framed.put_u8(0x01);
        framed.put_u16(payload.len() as u16);
        framed.extend_from_slice(&payload);

        let mut meta = base.meta.clone();
        meta.insert("start".into(), json!(0x01));
        meta.insert("declared".into(), json!(payload.len()));

        EncodedRpcPacket {
            debug: format!("XWB|len={}|{}", payload.len(), base.debug),
            raw: framed.freeze(),
            kind: FrameKind::XwbRequest,
            length_prefixed: None,
            meta,
            ..base
        }
    }

    fn decode(&self, buffer: &[u8], _used_length_prefix: bool) -> DecodedLines {
        if self.real_decode {
            let decoded = decode_xwb(buffer, &self.machine_opts, &self.metrics);
            return DecodedLines {
                ok: decoded.ok,
                lines: decoded.lines,
            };
        }
        // Inline provisional header parse
        if buffer.len() < 3 || buffer[0] != 0x01 {
            return DecodedLines {
                ok: false,
                lines: Vec::new(),
            };
        }
        let declared = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
        let payload = &buffer[3..];
        if payload.len() != declared {
            return DecodedLines {
                ok: false,
                lines: Vec::new(),
            };
        }
        let decoded = decode_rpc_response(payload);
        DecodedLines {
            ok: decoded.ok,
            lines: decoded.lines,
        }
    }
}

/// Select the codec implied by the configuration.
pub fn create_default_codec(
    config: &BrokerConfig,
    metrics: Arc<BrokerMetrics>,
) -> Box<dyn FrameCodec> {
    if config.xwb_codec {
        Box::new(XwbCodec::new(
            config.xwb_real_decode,
            XwbStateMachineOptions::from_config(config),
            metrics,
        ))
    } else {
        Box::new(SyntheticCodec::new(config.length_prefix))
    }
}

/// Frame response lines in the synthetic length-prefixed format, the way
/// the loopback peer does.
pub fn frame_response_lines(lines: &[&str]) -> Bytes {
    let mut payload = lines.join("\n");
    payload.push('\n');
    let mut framed = format!("{:04x}", payload.len()).into_bytes();
    framed.extend_from_slice(payload.as_bytes());
    Bytes::from(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_synthetic_codec_roundtrip_length_prefixed() {
        let codec = SyntheticCodec::new(true);
        let encoded = codec.encode("ORWPT LIST", &params(&["DOE"]));
        assert!(encoded.length_prefixed.is_some());

        let response = frame_response_lines(&["100^DOE,JOHN^1234^M^01/12/1965", "END"]);
        let decoded = codec.decode(&response, true);
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["100^DOE,JOHN^1234^M^01/12/1965"]);
    }

    #[test]
    fn test_synthetic_codec_without_prefix_decodes_plain_frames() {
        let codec = SyntheticCodec::new(false);
        let encoded = codec.encode("RPC", &params(&[]));
        assert!(encoded.length_prefixed.is_none());

        let decoded = codec.decode(b"ALPHA\nEND\n", false);
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["ALPHA"]);
    }

    #[test]
    fn test_xwb_codec_wraps_synthetic_payload() {
        let metrics = Arc::new(BrokerMetrics::new());
        let codec = XwbCodec::new(false, XwbStateMachineOptions::default(), metrics);
        let encoded = codec.encode("RPC", &params(&["P"]));

        assert_eq!(encoded.raw[0], 0x01);
        let declared = u16::from_be_bytes([encoded.raw[1], encoded.raw[2]]) as usize;
        assert_eq!(declared, encoded.raw.len() - 3);
        assert!(encoded.debug.starts_with("XWB|len="));
        assert!(encoded.length_prefixed.is_none());
    }

    #[test]
    fn test_xwb_codec_inline_decode() {
        let metrics = Arc::new(BrokerMetrics::new());
        let codec = XwbCodec::new(false, XwbStateMachineOptions::default(), metrics);

        let payload = b"ALPHA\nEND\n";
        let mut buffer = vec![0x01];
        buffer.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buffer.extend_from_slice(payload);

        let decoded = codec.decode(&buffer, false);
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["ALPHA"]);

        assert!(!codec.decode(&[0x02, 0x00, 0x01, b'x'], false).ok);
        assert!(!codec.decode(&[0x01], false).ok);
    }

    #[test]
    fn test_xwb_codec_real_decode_routes_through_state_machine() {
        let metrics = Arc::new(BrokerMetrics::new());
        let codec = XwbCodec::new(true, XwbStateMachineOptions::default(), metrics.clone());

        let payload = b"ONLY\n";
        let mut buffer = vec![0x01];
        buffer.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buffer.extend_from_slice(payload);

        let decoded = codec.decode(&buffer, false);
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["ONLY"]);
        // decode latency is recorded on the state-machine path
        assert_eq!(metrics.snapshot().decode_latency.count, 1);
    }

    #[test]
    fn test_default_codec_selection() {
        let metrics = Arc::new(BrokerMetrics::new());
        let config = BrokerConfig::default();
        let codec = create_default_codec(&config, metrics.clone());
        assert!(codec.encode("RPC", &[]).length_prefixed.is_some());

        let xwb_config = BrokerConfig {
            xwb_codec: true,
            ..BrokerConfig::default()
        };
        let codec = create_default_codec(&xwb_config, metrics);
        let encoded = codec.encode("RPC", &[]);
        assert_eq!(encoded.raw[0], 0x01);
    }
}
