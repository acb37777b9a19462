//! Incremental frame assembly across TCP chunk boundaries.
//!
//! Accumulates arbitrary inbound chunks in one growing buffer and slices off
//! complete synthetic length-prefixed frames as they become available. The
//! remainder after an extracted frame is retained for the next push, so
//! back-to-back frames arriving in a single chunk survive intact.

use bytes::{Bytes, BytesMut};

use crate::protocol::framing::{decode_length_prefixed, DecodedRpcPacket, FrameErrorCode};

/// Default safety cap on the accumulation buffer (256 KiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Result of a push that produced a frame or detected a framing fault.
#[derive(Debug)]
pub struct AssemblerResult {
    /// Decoded frame, when one was extracted.
    pub packet: Option<DecodedRpcPacket>,
    /// Unconsumed bytes remaining after extraction (may hold the start of,
    /// or a complete, subsequent frame).
    pub remainder: Bytes,
    /// Framing fault that dropped the buffer.
    pub error: Option<FrameErrorCode>,
}

/// Stateful byte accumulator for the synthetic length-prefixed format.
pub struct FrameAssembler {
    buffer: BytesMut,
    max_frame: usize,
}

impl FrameAssembler {
    /// Create an assembler with the default safety cap.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create an assembler with a custom safety cap.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame,
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Append a chunk and attempt to extract one frame.
    ///
    /// Returns `None` while more data is required (or for an empty chunk).
    /// At most one frame is extracted per call; the returned remainder is
    /// preserved verbatim internally for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Option<AssemblerResult> {
        if chunk.is_empty() {
            return None;
        }
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() > self.max_frame {
            // Unbounded growth from a misbehaving peer: drop everything.
            let remainder = self.buffer.split().freeze();
            return Some(AssemblerResult {
                packet: None,
                remainder,
                error: Some(FrameErrorCode::LengthMismatch),
            });
        }

        self.try_extract()
    }

    fn try_extract(&mut self) -> Option<AssemblerResult> {
        if self.buffer.len() < 4 {
            return None;
        }

        let declared = std::str::from_utf8(&self.buffer[..4])
            .ok()
            .and_then(|hex| usize::from_str_radix(hex, 16).ok());
        let declared = match declared {
            Some(d) => d,
            None => {
                // Unrecoverable framing confusion
                let remainder = self.buffer.split().freeze();
                return Some(AssemblerResult {
                    packet: None,
                    remainder,
                    error: Some(FrameErrorCode::UnknownFormat),
                });
            }
        };

        let total_needed = 4 + declared;
        if self.buffer.len() < total_needed {
            return None;
        }

        let frame = self.buffer.split_to(total_needed).freeze();
        let remainder = Bytes::copy_from_slice(&self.buffer);
        let packet = decode_length_prefixed(&frame);
        Some(AssemblerResult {
            packet: Some(packet),
            remainder,
            error: None,
        })
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
