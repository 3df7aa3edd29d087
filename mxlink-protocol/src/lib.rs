//! # mxlink-protocol
//!
//! Wire protocol implementation for MXP (Matrix Exchange Protocol), the
//! binary control protocol spoken by audio/intercom routing matrices.
//!
//! This crate provides:
//! - Marker-delimited frame assembly from a streaming byte buffer
//! - Frame encoding for outbound requests
//! - Message decode dispatch with sub-version detection
//! - A pluggable decoder registry for payload layouts
//!
//! It is deliberately free of I/O and async; `mxlink-client` drives it from
//! a TCP read loop.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;

pub use dispatch::{decode_reply, DecoderRegistry, ProtoVersion, Reply};
pub use error::ProtocolError;
pub use frame::{encode_frame, encode_frame_v2, FrameAssembler};
pub use message::Body;

/// Two-byte marker opening every MXP frame.
pub const START_MARKER: [u8; 2] = [0xA7, 0x55];

/// Two-byte marker terminating every MXP frame.
pub const END_MARKER: [u8; 2] = [0x55, 0xA7];

/// Four-byte marker signalling the v2 protocol sub-version. When present
/// immediately after the flags byte, the following byte is the schema number.
pub const V2_MARKER: [u8; 4] = *b"MXP2";

/// Smallest possible frame: start + length + message id + flags + end.
pub const MIN_FRAME_LEN: usize = 9;

/// Largest frame the u16 length field can describe (length covers everything
/// after the start marker, including the field itself).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize + 2;

/// Schema number implied by a legacy (v1) frame, which carries none.
pub const LEGACY_SCHEMA: u8 = 1;
