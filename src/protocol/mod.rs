//! Protocol module - frame encoding/decoding, assembly, and the XWB decode
//! state machine.
//!
//! Everything here is pure and synchronous; suspension happens only in the
//! transport layer.

mod assembler;
mod codec;
mod framing;
mod xwb_state;

pub use assembler::{AssemblerResult, FrameAssembler, DEFAULT_MAX_FRAME_BYTES};
pub use codec::{create_default_codec, frame_response_lines, DecodedLines, FrameCodec, SyntheticCodec, XwbCodec};
pub use framing::{
    decode_length_prefixed, decode_rpc_response, decode_xwb, encode_rpc, sanitize_for_log,
    DecodedRpcPacket, EncodeOptions, EncodedRpcPacket, FrameErrorCode, FrameKind, PacketMeta,
    END_SENTINEL, FRAME_TRAILER, RPC_NAME_WIDTH, XWB_HEADER_LEN,
};
pub use xwb_state::{
    HeaderParse, HeaderStrategy, ProvisionalHeaderStrategy, StrictHeaderStrategy, XwbDecodeState,
    XwbHeader, XwbStateError, XwbStateMachine, XwbStateMachineOptions, XwbStateResult,
    DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_MULTIPART_BYTES,
};
