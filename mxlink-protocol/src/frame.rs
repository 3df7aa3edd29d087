//! MXP frame encoding and stream reassembly.
//!
//! Frame layout:
//!
//! ```text
//! +--------+--------+------------+-------+-----------------+---------+--------+
//! | START  | LENGTH | MESSAGE_ID | FLAGS | [MXP2 | SCHEMA] | PAYLOAD |  END   |
//! | 2 bytes| 2 bytes|  2 bytes   | 1 byte|  [4 + 1 bytes]  |   var   | 2 bytes|
//! +--------+--------+------------+-------+-----------------+---------+--------+
//! ```
//!
//! LENGTH is big-endian and covers every byte after the start marker,
//! including the length field itself through the end marker. The bracketed
//! sub-version block is present only on v2 frames.

use crate::error::ProtocolError;
use crate::{END_MARKER, MAX_FRAME_LEN, MIN_FRAME_LEN, START_MARKER, V2_MARKER};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes a legacy (v1) frame for the given message id and payload.
pub fn encode_frame(
    message_id: u16,
    flags: u8,
    payload: &[u8],
) -> Result<BytesMut, ProtocolError> {
    let total = MIN_FRAME_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_LEN - MIN_FRAME_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&START_MARKER);
    buf.put_u16((total - 2) as u16);
    buf.put_u16(message_id);
    buf.put_u8(flags);
    buf.put_slice(payload);
    buf.put_slice(&END_MARKER);
    Ok(buf)
}

/// Encodes a v2 frame carrying the sub-version marker and a schema number.
pub fn encode_frame_v2(
    message_id: u16,
    flags: u8,
    schema: u8,
    payload: &[u8],
) -> Result<BytesMut, ProtocolError> {
    let total = MIN_FRAME_LEN + V2_MARKER.len() + 1 + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_LEN - MIN_FRAME_LEN - V2_MARKER.len() - 1,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&START_MARKER);
    buf.put_u16((total - 2) as u16);
    buf.put_u16(message_id);
    buf.put_u8(flags);
    buf.put_slice(&V2_MARKER);
    buf.put_u8(schema);
    buf.put_slice(payload);
    buf.put_slice(&END_MARKER);
    Ok(buf)
}

/// Reassembles MXP frames from an append-only stream of socket reads.
///
/// TCP delivers the byte stream with no message boundaries; the assembler
/// scans for the fixed start/end markers, re-validates candidates against
/// the embedded length field, and emits complete frames. Garbage never
/// produces an error: noise before a start marker is trimmed, candidates
/// whose length field disagrees with their span are dropped, and a buffer
/// ending in one byte of a split start marker keeps that byte for the next
/// read.
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Appends freshly read bytes to the stream buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of unconsumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extracts the next complete, length-validated frame, if any.
    ///
    /// Call repeatedly after each `extend` until it returns `None`; the
    /// buffer is left either starting at a start marker awaiting its
    /// terminator, or holding at most one trailing byte of a split marker.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let Some(start) = find_marker(&self.buf, &START_MARKER) else {
                // No start marker anywhere: only a split marker's first byte
                // at the very end is worth keeping.
                match self.buf.last() {
                    Some(&b) if b == START_MARKER[0] => {
                        let tail = self.buf.len() - 1;
                        self.buf.advance(tail);
                    }
                    _ => self.buf.clear(),
                }
                return None;
            };

            if start > 0 {
                // Noise before the marker.
                tracing::trace!(discarded = start, "discarding bytes before start marker");
                self.buf.advance(start);
            }

            let Some(end) = find_marker(&self.buf[2..], &END_MARKER) else {
                if self.buf.len() > MAX_FRAME_LEN {
                    // The length field cannot describe a span this long, so
                    // this start marker can never head a valid frame.
                    tracing::debug!(
                        buffered = self.buf.len(),
                        "abandoning oversized start marker"
                    );
                    self.buf.advance(2);
                    continue;
                }
                // Frame still in flight; wait for more bytes.
                return None;
            };

            // Candidate spans the start marker through the end marker.
            let frame_len = 2 + end + 2;
            let candidate = self.buf.split_to(frame_len).freeze();

            if candidate.len() >= 6 {
                let declared =
                    u16::from_be_bytes([candidate[2], candidate[3]]) as usize;
                if declared == candidate.len() - 2 {
                    return Some(candidate);
                }
            }

            // A marker pair that happened to line up inside payload data, or
            // a truncated tail of a frame we already gave up on.
            tracing::trace!(len = candidate.len(), "dropping length-mismatched candidate");
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}
