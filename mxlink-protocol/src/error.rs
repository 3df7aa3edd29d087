//! Protocol error types.

use thiserror::Error;

/// Errors surfaced by frame encoding and reply dispatch.
///
/// Framing never errors on garbage input: noise and length-mismatched
/// candidates are dropped silently by the assembler. These variants cover
/// the remaining structural failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short for MXP header: {len} bytes (min {min})")]
    FrameTooShort { len: usize, min: usize },

    #[error("frame missing start marker")]
    MissingStartMarker,

    #[error("frame missing end marker")]
    MissingEndMarker,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
