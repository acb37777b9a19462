//! XWB response decode state machine.
//!
//! Incrementally consumes a buffer to extract one logical XWB response,
//! including multi-part responses joined by continuation markers:
//!
//! ```text
//! HEADER ──► BODY ──► COMPLETE          (terminal success)
//! HEADER ──► INTERIM ──► HEADER ──► …   (continuation marker loop)
//! any    ──► ERROR                      (terminal failure)
//! ```
//!
//! The authentic XWB header layout is not fully reverse-engineered, so the
//! header parse is a pluggable [`HeaderStrategy`] injected at construction:
//! a provisional single-byte-marker format and a strict two-byte-marker
//! format exist side by side, and both must remain swappable.
//!
//! A machine is owned by one decode attempt; terminal states reject further
//! `feed` calls until [`reset`](XwbStateMachine::reset).

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;
use crate::protocol::framing::split_lines;

/// Default per-header body length cap (256 KiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;

/// Default multi-part accumulation guard (512 KiB).
pub const DEFAULT_MAX_MULTIPART_BYTES: usize = 512 * 1024;

/// Decode states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum XwbDecodeState {
    Header,
    Body,
    Interim,
    Complete,
    Error,
}

impl XwbDecodeState {
    /// Stable string form used in metadata and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            XwbDecodeState::Header => "HEADER",
            XwbDecodeState::Body => "BODY",
            XwbDecodeState::Interim => "INTERIM",
            XwbDecodeState::Complete => "COMPLETE",
            XwbDecodeState::Error => "ERROR",
        }
    }
}

/// State machine failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum XwbStateError {
    BadStart,
    BodyTooLarge,
    MultipartSizeExceeded,
    AlreadyTerminal,
}

impl XwbStateError {
    /// Stable string form used as a metrics key.
    pub fn as_str(&self) -> &'static str {
        match self {
            XwbStateError::BadStart => "BAD_START",
            XwbStateError::BodyTooLarge => "BODY_TOO_LARGE",
            XwbStateError::MultipartSizeExceeded => "MULTIPART_SIZE_EXCEEDED",
            XwbStateError::AlreadyTerminal => "ALREADY_TERMINAL",
        }
    }
}

/// Parsed header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XwbHeader {
    /// Start marker value as read off the wire.
    pub start: u16,
    /// Declared body length in bytes.
    pub length: usize,
    /// Zero-length continuation marker: more segments follow.
    pub continuation: bool,
}

/// Outcome of one header parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParse {
    /// Not enough bytes yet; `needed` more are required.
    NeedMore { needed: usize },
    /// Unrecoverable header failure.
    Invalid {
        error: XwbStateError,
        consumed: usize,
    },
    /// Header parsed; `consumed` header bytes.
    Parsed { header: XwbHeader, consumed: usize },
}

/// Pluggable header parse strategy.
pub trait HeaderStrategy: Send + Sync {
    /// Minimum bytes required before a parse can be attempted.
    fn min_bytes(&self) -> usize;
    /// Parse a header from the start of `buffer`.
    fn parse(&self, buffer: &[u8]) -> HeaderParse;
}

/// Provisional header: `[0x01][u16 BE length]`.
///
/// A declared length of zero is a continuation marker.
#[derive(Debug, Clone)]
pub struct ProvisionalHeaderStrategy {
    max_length: usize,
}

impl ProvisionalHeaderStrategy {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl HeaderStrategy for ProvisionalHeaderStrategy {
    fn min_bytes(&self) -> usize {
        3
    }

    fn parse(&self, buffer: &[u8]) -> HeaderParse {
        if buffer.len() < 3 {
            return HeaderParse::NeedMore {
                needed: 3 - buffer.len(),
            };
        }
        if buffer[0] != 0x01 {
            return HeaderParse::Invalid {
                error: XwbStateError::BadStart,
                consumed: 1,
            };
        }
        let length = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
        if length > self.max_length {
            return HeaderParse::Invalid {
                error: XwbStateError::BodyTooLarge,
                consumed: 3,
            };
        }
        HeaderParse::Parsed {
            header: XwbHeader {
                start: 0x01,
                length,
                continuation: length == 0,
            },
            consumed: 3,
        }
    }
}

/// Strict header stub: `[0x00 0x01][u16 BE length]`.
///
/// Placeholder layout pending protocol reverse-engineering; rejects
/// provisional-format frames outright.
#[derive(Debug, Clone)]
pub struct StrictHeaderStrategy {
    max_length: usize,
}

impl StrictHeaderStrategy {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl HeaderStrategy for StrictHeaderStrategy {
    fn min_bytes(&self) -> usize {
        4
    }

    fn parse(&self, buffer: &[u8]) -> HeaderParse {
        if buffer.len() < 4 {
            return HeaderParse::NeedMore {
                needed: 4 - buffer.len(),
            };
        }
        if buffer[0] != 0x00 || buffer[1] != 0x01 {
            return HeaderParse::Invalid {
                error: XwbStateError::BadStart,
                consumed: 1,
            };
        }
        let length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
        if length > self.max_length {
            return HeaderParse::Invalid {
                error: XwbStateError::BodyTooLarge,
                consumed: 4,
            };
        }
        HeaderParse::Parsed {
            header: XwbHeader {
                start: 0x0001,
                length,
                continuation: false,
            },
            consumed: 4,
        }
    }
}

/// Output of one [`XwbStateMachine::feed`] call.
#[derive(Debug, Clone)]
pub struct XwbStateResult {
    /// State after processing this call.
    pub state: XwbDecodeState,
    /// True only when a complete body was produced.
    pub ok: bool,
    /// Bytes consumed from the supplied buffer.
    pub consumed: usize,
    /// Body lines (only on completion).
    pub lines: Vec<String>,
    /// Failure kind when terminal in error.
    pub error: Option<XwbStateError>,
    /// Additional bytes required, when known.
    pub needed: Option<usize>,
    /// Most recently parsed header.
    pub header: Option<XwbHeader>,
}

/// Construction options for [`XwbStateMachine`].
#[derive(Debug, Clone)]
pub struct XwbStateMachineOptions {
    /// Per-header declared body length cap.
    pub max_body_bytes: usize,
    /// Guard on the accumulated size of a multi-part sequence.
    pub max_multipart_bytes: usize,
    /// Select the strict header strategy instead of the provisional one.
    pub strict_header: bool,
}

impl Default for XwbStateMachineOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_multipart_bytes: DEFAULT_MAX_MULTIPART_BYTES,
            strict_header: false,
        }
    }
}

impl XwbStateMachineOptions {
    /// Derive machine options from the broker configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_multipart_bytes: config.multipart_max_bytes,
            strict_header: config.strict_header,
            ..Self::default()
        }
    }
}

/// Stateful XWB response decoder.
pub struct XwbStateMachine {
    state: XwbDecodeState,
    needed: usize,
    declared_length: usize,
    parts: Vec<Bytes>,
    accumulated: usize,
    multipart_active: bool,
    max_multipart: usize,
    strategy: Box<dyn HeaderStrategy>,
    header: Option<XwbHeader>,
    metrics: Arc<BrokerMetrics>,
}

impl XwbStateMachine {
    /// Create a machine, selecting the header strategy from the options.
    pub fn new(opts: XwbStateMachineOptions, metrics: Arc<BrokerMetrics>) -> Self {
        let strategy: Box<dyn HeaderStrategy> = if opts.strict_header {
            Box::new(StrictHeaderStrategy::new(opts.max_body_bytes))
        } else {
            Box::new(ProvisionalHeaderStrategy::new(opts.max_body_bytes))
        };
        Self::with_strategy(strategy, opts, metrics)
    }

    /// Create a machine with an explicitly injected header strategy.
    pub fn with_strategy(
        strategy: Box<dyn HeaderStrategy>,
        opts: XwbStateMachineOptions,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let needed = strategy.min_bytes();
        Self {
            state: XwbDecodeState::Header,
            needed,
            declared_length: 0,
            parts: Vec::new(),
            accumulated: 0,
            multipart_active: false,
            max_multipart: opts.max_multipart_bytes,
            strategy,
            header: None,
            metrics,
        }
    }

    /// Current state.
    pub fn state(&self) -> XwbDecodeState {
        self.state
    }

    /// Return to the initial `HEADER` state with cleared accumulation, for
    /// reuse across independent frames.
    pub fn reset(&mut self) {
        self.state = XwbDecodeState::Header;
        self.needed = self.strategy.min_bytes();
        self.declared_length = 0;
        self.parts.clear();
        self.accumulated = 0;
        self.multipart_active = false;
        self.header = None;
    }

    /// Process a buffer starting at the current protocol position.
    ///
    /// After an `INTERIM` result the caller must call `feed` again with data
    /// that starts at the next header.
    pub fn feed(&mut self, buffer: &[u8]) -> XwbStateResult {
        match self.state {
            XwbDecodeState::Complete | XwbDecodeState::Error => {
                return XwbStateResult {
                    state: self.state,
                    ok: self.state == XwbDecodeState::Complete,
                    consumed: 0,
                    lines: Vec::new(),
                    error: (self.state == XwbDecodeState::Error)
                        .then_some(XwbStateError::AlreadyTerminal),
                    needed: None,
                    header: self.header,
                };
            }
            XwbDecodeState::Interim => {
                // Re-arm for the next header; no bytes consumed in this step.
                self.state = XwbDecodeState::Header;
                self.needed = self.strategy.min_bytes();
                return XwbStateResult {
                    state: XwbDecodeState::Interim,
                    ok: false,
                    consumed: 0,
                    lines: Vec::new(),
                    error: None,
                    needed: None,
                    header: self.header,
                };
            }
            _ => {}
        }

        let mut offset = 0;
        if self.state == XwbDecodeState::Header {
            match self.strategy.parse(buffer) {
                HeaderParse::NeedMore { needed } => {
                    self.needed = needed;
                    return XwbStateResult {
                        state: XwbDecodeState::Header,
                        ok: false,
                        consumed: 0,
                        lines: Vec::new(),
                        error: None,
                        needed: Some(needed),
                        header: self.header,
                    };
                }
                HeaderParse::Invalid { error, consumed } => {
                    self.state = XwbDecodeState::Error;
                    return XwbStateResult {
                        state: XwbDecodeState::Error,
                        ok: false,
                        consumed,
                        lines: Vec::new(),
                        error: Some(error),
                        needed: None,
                        header: self.header,
                    };
                }
                HeaderParse::Parsed { header, consumed } => {
                    self.header = Some(header);
                    if header.continuation {
                        // Continuation marker: the sequence becomes
                        // multi-part; no payload for this segment.
                        self.parts.push(Bytes::new());
                        self.state = XwbDecodeState::Interim;
                        self.metrics.record_frame_continuation();
                        return XwbStateResult {
                            state: XwbDecodeState::Interim,
                            ok: false,
                            consumed,
                            lines: Vec::new(),
                            error: None,
                            needed: None,
                            header: self.header,
                        };
                    }
                    self.declared_length = header.length;
                    offset = consumed;
                    self.state = XwbDecodeState::Body;
                }
            }
        }

        debug_assert_eq!(self.state, XwbDecodeState::Body);
        let remaining = buffer.len().saturating_sub(offset);
        if remaining < self.declared_length {
            self.needed = self.declared_length - remaining;
            return XwbStateResult {
                state: XwbDecodeState::Body,
                ok: false,
                consumed: 0,
                lines: Vec::new(),
                error: None,
                needed: Some(self.needed),
                header: self.header,
            };
        }

        let payload = Bytes::copy_from_slice(&buffer[offset..offset + self.declared_length]);
        self.accumulated += payload.len();
        self.parts.push(payload);
        let consumed = offset + self.declared_length;

        if self.accumulated > self.max_multipart {
            self.metrics.record_frame_multipart_exceeded();
            self.state = XwbDecodeState::Error;
            return XwbStateResult {
                state: XwbDecodeState::Error,
                ok: false,
                consumed,
                lines: Vec::new(),
                error: Some(XwbStateError::MultipartSizeExceeded),
                needed: None,
                header: self.header,
            };
        }

        if self.parts.len() >= 2 && !self.multipart_active {
            self.multipart_active = true;
            self.metrics.record_frame_multipart_start();
        }

        let body: Vec<u8> = self.parts.iter().flat_map(|p| p.iter().copied()).collect();
        self.state = XwbDecodeState::Complete;

        if self.multipart_active {
            // Content checksum recorded for observability only.
            let checksum = hex::encode(Sha256::digest(&body));
            self.metrics.set_frame_multipart_checksum(checksum);
            self.metrics.record_frame_multipart_complete();
        }

        let text = String::from_utf8_lossy(&body);
        let lines = split_lines(&text);
        XwbStateResult {
            state: XwbDecodeState::Complete,
            ok: true,
            consumed,
            lines,
            error: None,
            needed: None,
            header: self.header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> XwbStateMachine {
        XwbStateMachine::new(
            XwbStateMachineOptions::default(),
            Arc::new(BrokerMetrics::new()),
        )
    }

    fn machine_with_metrics(metrics: &Arc<BrokerMetrics>) -> XwbStateMachine {
        XwbStateMachine::new(XwbStateMachineOptions::default(), metrics.clone())
    }

    fn provisional_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x01];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn continuation_marker() -> Vec<u8> {
        vec![0x01, 0x00, 0x00]
    }

    #[test]
    fn test_needs_more_bytes_for_partial_header() {
        let mut sm = machine();
        let res = sm.feed(&[0x01]);
        assert_eq!(res.state, XwbDecodeState::Header);
        assert_eq!(res.needed, Some(2));
        assert_eq!(res.consumed, 0);
    }

    #[test]
    fn test_single_part_frame_completes() {
        let mut sm = machine();
        let res = sm.feed(&provisional_frame(b"LINE1\nLINE2\n"));
        assert_eq!(res.state, XwbDecodeState::Complete);
        assert!(res.ok);
        assert_eq!(res.lines, vec!["LINE1", "LINE2"]);
        assert_eq!(res.consumed, 3 + 12);
        assert_eq!(res.header.unwrap().length, 12);
    }

    #[test]
    fn test_partial_body_reports_shortfall() {
        let mut sm = machine();
        let frame = provisional_frame(b"0123456789");
        let res = sm.feed(&frame[..7]);
        assert_eq!(res.state, XwbDecodeState::Body);
        assert_eq!(res.needed, Some(6));
    }

    #[test]
    fn test_bad_start_marker_is_terminal() {
        let mut sm = machine();
        let res = sm.feed(&[0x7F, 0x00, 0x05, b'a']);
        assert_eq!(res.state, XwbDecodeState::Error);
        assert_eq!(res.error, Some(XwbStateError::BadStart));
        assert_eq!(res.consumed, 1);

        // Terminal until reset
        let res = sm.feed(&provisional_frame(b"X"));
        assert_eq!(res.state, XwbDecodeState::Error);
        assert_eq!(res.error, Some(XwbStateError::AlreadyTerminal));
    }

    #[test]
    fn test_body_too_large_rejected_at_header() {
        let metrics = Arc::new(BrokerMetrics::new());
        let mut sm = XwbStateMachine::new(
            XwbStateMachineOptions {
                max_body_bytes: 16,
                ..Default::default()
            },
            metrics,
        );
        let mut frame = vec![0x01];
        frame.extend_from_slice(&100u16.to_be_bytes());
        let res = sm.feed(&frame);
        assert_eq!(res.state, XwbDecodeState::Error);
        assert_eq!(res.error, Some(XwbStateError::BodyTooLarge));
    }

    #[test]
    fn test_continuation_sequence_completes_with_multipart_metrics() {
        let metrics = Arc::new(BrokerMetrics::new());
        let mut sm = machine_with_metrics(&metrics);

        let r1 = sm.feed(&continuation_marker());
        assert_eq!(r1.state, XwbDecodeState::Interim);
        assert_eq!(r1.consumed, 3);
        assert!(r1.header.unwrap().continuation);

        // INTERIM re-arms without consuming; same buffer is fed again
        let frame = provisional_frame(b"PART2\n");
        let r2 = sm.feed(&frame);
        assert_eq!(r2.state, XwbDecodeState::Interim);
        assert_eq!(r2.consumed, 0);

        let r3 = sm.feed(&frame);
        assert_eq!(r3.state, XwbDecodeState::Complete);
        assert!(r3.ok);
        assert_eq!(r3.lines, vec!["PART2"]);

        let snap = metrics.snapshot();
        assert_eq!(snap.frames.continuations, 1);
        assert_eq!(snap.frames.multipart_started, 1);
        assert_eq!(snap.frames.multipart_completed, 1);
        assert!(snap.frames.multipart_checksum.is_some());
    }

    #[test]
    fn test_single_part_frame_sets_no_multipart_metrics() {
        let metrics = Arc::new(BrokerMetrics::new());
        let mut sm = machine_with_metrics(&metrics);
        let res = sm.feed(&provisional_frame(b"ONLYONE\n"));
        assert!(res.ok);

        let snap = metrics.snapshot();
        assert_eq!(snap.frames.multipart_started, 0);
        assert_eq!(snap.frames.multipart_completed, 0);
        assert_eq!(snap.frames.multipart_checksum, None);
    }

    #[test]
    fn test_multipart_size_guard() {
        let metrics = Arc::new(BrokerMetrics::new());
        let mut sm = XwbStateMachine::new(
            XwbStateMachineOptions {
                max_multipart_bytes: 4 * 1024,
                ..Default::default()
            },
            metrics.clone(),
        );

        let r1 = sm.feed(&continuation_marker());
        assert_eq!(r1.state, XwbDecodeState::Interim);

        let payload = vec![0x41; 8 * 1024];
        let frame = provisional_frame(&payload);
        let r2 = sm.feed(&frame); // INTERIM re-arm
        assert_eq!(r2.state, XwbDecodeState::Interim);
        let r3 = sm.feed(&frame);
        assert_eq!(r3.state, XwbDecodeState::Error);
        assert_eq!(r3.error, Some(XwbStateError::MultipartSizeExceeded));
        assert_eq!(metrics.snapshot().frames.multipart_exceeded, 1);
    }

    #[test]
    fn test_complete_is_terminal_until_reset() {
        let mut sm = machine();
        let frame = provisional_frame(b"A\n");
        assert!(sm.feed(&frame).ok);

        let res = sm.feed(&frame);
        assert_eq!(res.state, XwbDecodeState::Complete);
        assert_eq!(res.consumed, 0);
        assert!(res.lines.is_empty());

        sm.reset();
        assert_eq!(sm.state(), XwbDecodeState::Header);
        let res = sm.feed(&frame);
        assert!(res.ok);
        assert_eq!(res.lines, vec!["A"]);
    }

    #[test]
    fn test_strict_strategy_rejects_provisional_frame() {
        let metrics = Arc::new(BrokerMetrics::new());
        let mut sm = XwbStateMachine::new(
            XwbStateMachineOptions {
                strict_header: true,
                ..Default::default()
            },
            metrics,
        );
        let res = sm.feed(&provisional_frame(b"ABC"));
        assert_eq!(res.state, XwbDecodeState::Error);
        assert_eq!(res.error, Some(XwbStateError::BadStart));
    }

    #[test]
    fn test_strict_strategy_parses_stub_header() {
        let metrics = Arc::new(BrokerMetrics::new());
        let mut sm = XwbStateMachine::new(
            XwbStateMachineOptions {
                strict_header: true,
                ..Default::default()
            },
            metrics,
        );
        let payload = b"HELLO";
        let mut frame = vec![0x00, 0x01];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);

        let res = sm.feed(&frame);
        assert!(res.ok);
        assert_eq!(res.header.unwrap().length, payload.len());
        assert_eq!(res.lines, vec!["HELLO"]);
    }

    #[test]
    fn test_injected_strategy_is_used() {
        struct FixedStrategy;
        impl HeaderStrategy for FixedStrategy {
            fn min_bytes(&self) -> usize {
                1
            }
            fn parse(&self, buffer: &[u8]) -> HeaderParse {
                HeaderParse::Parsed {
                    header: XwbHeader {
                        start: buffer[0] as u16,
                        length: 2,
                        continuation: false,
                    },
                    consumed: 1,
                }
            }
        }

        let mut sm = XwbStateMachine::with_strategy(
            Box::new(FixedStrategy),
            XwbStateMachineOptions::default(),
            Arc::new(BrokerMetrics::new()),
        );
        let res = sm.feed(&[0xAA, b'H', b'I']);
        assert!(res.ok);
        assert_eq!(res.lines, vec!["HI"]);
    }
}
