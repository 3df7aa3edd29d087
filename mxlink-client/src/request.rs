//! Outbound request type.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use mxlink_protocol::{encode_frame, encode_frame_v2, Reply};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A unit of outbound work.
///
/// Built by a caller, consumed exactly once by the transport's send path.
/// If an expected reply identifier is declared, the matching inbound reply
/// (or a send failure, or a timeout) resolves the completion slot at most
/// once.
#[derive(Debug)]
pub struct Request {
    /// Message identifier written into the frame header.
    pub message_id: u16,
    /// Serialized payload bytes.
    pub payload: Bytes,
    /// Flag byte written into the frame header.
    pub flags: u8,
    /// Schema number; `Some` encodes a v2 frame, `None` a legacy frame.
    pub schema: Option<u8>,
    /// Message identifier the reply is expected to arrive under.
    pub expect_reply: Option<u16>,
    /// Whether this request jumps ahead of normally queued requests.
    pub urgent: bool,
    /// Creation time, used to order requests within the urgent prefix.
    pub created_at: Instant,
    /// Single-shot completion slot for a caller awaiting the reply.
    pub(crate) completion: Option<oneshot::Sender<Reply>>,
}

impl Request {
    /// Creates a fire-and-forget request.
    pub fn new(message_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
            flags: 0,
            schema: None,
            expect_reply: None,
            urgent: false,
            created_at: Instant::now(),
            completion: None,
        }
    }

    /// Declares the message identifier the reply will arrive under.
    pub fn expecting(mut self, reply_id: u16) -> Self {
        self.expect_reply = Some(reply_id);
        self
    }

    /// Marks the request urgent.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Sets the frame flag byte.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Encodes as a v2 frame with the given schema number.
    pub fn with_schema(mut self, schema: u8) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Serializes the request into a complete wire frame.
    pub fn encode(&self) -> Result<BytesMut, ClientError> {
        let frame = match self.schema {
            Some(schema) => encode_frame_v2(self.message_id, self.flags, schema, &self.payload)?,
            None => encode_frame(self.message_id, self.flags, &self.payload)?,
        };
        Ok(frame)
    }
}
