// src/core/protocol/messages.rs

//! The LLRP message model exchanged between the server and its controlling
//! client.
//!
//! Only the messages the session core itself produces or consumes are given
//! structured bodies. Every other valid LLRP message decodes into
//! [`MessageBody::Other`] and is handed to the owning service untouched.

use crate::core::protocol::{LlrpStatus, ProtocolVersion};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// LLRP message type codes used by the session core.
pub mod type_codes {
    pub const CLOSE_CONNECTION_RESPONSE: u16 = 4;
    pub const CLOSE_CONNECTION: u16 = 14;
    pub const GET_SUPPORTED_VERSION: u16 = 46;
    pub const SET_PROTOCOL_VERSION: u16 = 47;
    pub const GET_SUPPORTED_VERSION_RESPONSE: u16 = 56;
    pub const SET_PROTOCOL_VERSION_RESPONSE: u16 = 57;
    pub const KEEPALIVE: u16 = 62;
    pub const READER_EVENT_NOTIFICATION: u16 = 63;
    pub const KEEPALIVE_ACK: u16 = 72;
    pub const ERROR_MESSAGE: u16 = 100;
    pub const CUSTOM_MESSAGE: u16 = 1023;
}

/// Returns true when `msg_type` is a valid LLRP 1.x message type code.
///
/// Frames carrying any other code are answered with an M_UnsupportedMessage
/// error reply instead of being delivered.
pub fn is_known_message_type(msg_type: u16) -> bool {
    matches!(
        msg_type,
        1..=4 | 11..=14 | 20..=26 | 30..=36 | 40..=47 | 50..=57 | 60..=64 | 72 | 100 | 1023
    )
}

/// A timestamp attached to spontaneous notifications.
///
/// UTC microseconds since the epoch when the platform clock can provide
/// them, monotonic uptime microseconds otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Utc(u64),
    Uptime(u64),
}

/// The event payload of a READER_EVENT_NOTIFICATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    ConnectionAttempt(ConnectionAttemptStatus),
    ConnectionClose,
}

/// The status field of a ConnectionAttemptEvent parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAttemptStatus {
    Success,
    FailedReaderConnectionExists,
    FailedClientConnectionExists,
    FailedOther,
    AnotherConnectionAttempted,
}

impl ConnectionAttemptStatus {
    pub fn as_u16(self) -> u16 {
        match self {
            ConnectionAttemptStatus::Success => 0,
            ConnectionAttemptStatus::FailedReaderConnectionExists => 1,
            ConnectionAttemptStatus::FailedClientConnectionExists => 2,
            ConnectionAttemptStatus::FailedOther => 3,
            ConnectionAttemptStatus::AnotherConnectionAttempted => 4,
        }
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(ConnectionAttemptStatus::Success),
            1 => Some(ConnectionAttemptStatus::FailedReaderConnectionExists),
            2 => Some(ConnectionAttemptStatus::FailedClientConnectionExists),
            3 => Some(ConnectionAttemptStatus::FailedOther),
            4 => Some(ConnectionAttemptStatus::AnotherConnectionAttempted),
            _ => None,
        }
    }
}

/// The body of an LLRP message, by message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Keepalive,
    KeepaliveAck,
    CloseConnection,
    CloseConnectionResponse {
        status: LlrpStatus,
    },
    ReaderEventNotification {
        timestamp: Timestamp,
        event: ReaderEvent,
    },
    ErrorMessage {
        status: LlrpStatus,
    },
    GetSupportedVersion,
    GetSupportedVersionResponse {
        current: ProtocolVersion,
        supported: ProtocolVersion,
        status: LlrpStatus,
    },
    SetProtocolVersion {
        version: ProtocolVersion,
    },
    SetProtocolVersionResponse {
        status: LlrpStatus,
    },
    /// Any other valid LLRP message, carried opaquely for the owning service.
    Other {
        msg_type: u16,
        payload: Bytes,
    },
}

impl MessageBody {
    /// The wire type code this body encodes to.
    pub fn msg_type(&self) -> u16 {
        match self {
            MessageBody::Keepalive => type_codes::KEEPALIVE,
            MessageBody::KeepaliveAck => type_codes::KEEPALIVE_ACK,
            MessageBody::CloseConnection => type_codes::CLOSE_CONNECTION,
            MessageBody::CloseConnectionResponse { .. } => type_codes::CLOSE_CONNECTION_RESPONSE,
            MessageBody::ReaderEventNotification { .. } => type_codes::READER_EVENT_NOTIFICATION,
            MessageBody::ErrorMessage { .. } => type_codes::ERROR_MESSAGE,
            MessageBody::GetSupportedVersion => type_codes::GET_SUPPORTED_VERSION,
            MessageBody::GetSupportedVersionResponse { .. } => {
                type_codes::GET_SUPPORTED_VERSION_RESPONSE
            }
            MessageBody::SetProtocolVersion { .. } => type_codes::SET_PROTOCOL_VERSION,
            MessageBody::SetProtocolVersionResponse { .. } => {
                type_codes::SET_PROTOCOL_VERSION_RESPONSE
            }
            MessageBody::Other { msg_type, .. } => *msg_type,
        }
    }
}

/// A complete LLRP message: frame header fields plus the decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlrpMessage {
    pub version: ProtocolVersion,
    pub message_id: u32,
    pub body: MessageBody,
}

impl LlrpMessage {
    pub fn new(version: ProtocolVersion, message_id: u32, body: MessageBody) -> Self {
        Self {
            version,
            message_id,
            body,
        }
    }

    pub fn msg_type(&self) -> u16 {
        self.body.msg_type()
    }
}

/// Hands out message ids for spontaneous server-originated messages.
///
/// One allocator per session instance, shared by everything that sends on
/// that session's behalf. Cloning shares the underlying counter.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    next: Arc<AtomicU32>,
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
