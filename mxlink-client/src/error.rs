//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] mxlink_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("cancelled by caller")]
    Cancelled,

    /// A correlated reply arrived but its payload did not carry the
    /// expected shape.
    #[error("unexpected reply for message 0x{message_id:04X}")]
    UnexpectedReply { message_id: u16 },
}

impl ClientError {
    /// Returns whether retrying the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }
}
