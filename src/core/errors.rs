// src/core/errors.rs

//! Defines the primary error type for the entire application.

use crate::core::protocol::StatusCode;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum LlrpError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// A message arrived on the wire but could not be decoded. Recoverable:
    /// the session answers with an ERROR_MESSAGE and keeps the channel open.
    #[error("Decode Error: {0}")]
    Decode(DecodeError),

    /// The peer disconnected, or the channel was closed locally while a
    /// receive was pending.
    #[error("Channel is gone")]
    ChannelGone,

    #[error("Operation timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("missing keepalive acknowledgment after {interval_ms} ms")]
    MissingKeepalive { interval_ms: u64 },

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl PartialEq for LlrpError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LlrpError::Io(e1), LlrpError::Io(e2)) => e1.to_string() == e2.to_string(),
            (LlrpError::Decode(d1), LlrpError::Decode(d2)) => d1 == d2,
            (LlrpError::Timeout { elapsed_ms: t1 }, LlrpError::Timeout { elapsed_ms: t2 }) => {
                t1 == t2
            }
            (
                LlrpError::MissingKeepalive { interval_ms: i1 },
                LlrpError::MissingKeepalive { interval_ms: i2 },
            ) => i1 == i2,
            (LlrpError::Transport(s1), LlrpError::Transport(s2)) => s1 == s2,
            (LlrpError::InvalidState(s1), LlrpError::InvalidState(s2)) => s1 == s2,
            (LlrpError::Internal(s1), LlrpError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

/// A classified decoding fault for an inbound frame.
///
/// Every variant carries the message id parsed out of the offending frame
/// header (zero when the header itself was unreadable) so that the error
/// reply can echo it back to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported protocol version {version} in message {message_id}")]
    UnsupportedVersion { version: u8, message_id: u32 },

    #[error("unsupported message type {msg_type} in message {message_id}")]
    UnsupportedMessageType { msg_type: u16, message_id: u32 },

    #[error("malformed parameter in message type {msg_type} (id {message_id}): {detail}")]
    ParameterError {
        msg_type: u16,
        message_id: u32,
        detail: String,
    },
}

impl DecodeError {
    /// The LLRP status code that an ERROR_MESSAGE reply for this fault carries.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DecodeError::UnsupportedVersion { .. } => StatusCode::MUnsupportedVersion,
            DecodeError::UnsupportedMessageType { .. } => StatusCode::MUnsupportedMessage,
            DecodeError::ParameterError { .. } => StatusCode::MParameterError,
        }
    }

    /// The id of the offending message, echoed in the error reply.
    pub fn message_id(&self) -> u32 {
        match self {
            DecodeError::UnsupportedVersion { message_id, .. }
            | DecodeError::UnsupportedMessageType { message_id, .. }
            | DecodeError::ParameterError { message_id, .. } => *message_id,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for LlrpError {
    fn from(e: std::io::Error) -> Self {
        LlrpError::Io(Arc::new(e))
    }
}

impl From<DecodeError> for LlrpError {
    fn from(e: DecodeError) -> Self {
        LlrpError::Decode(e)
    }
}
