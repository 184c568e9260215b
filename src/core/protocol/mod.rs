// src/core/protocol/mod.rs

pub mod codec;
pub mod messages;
pub mod status;
pub mod version;

pub use codec::{Inbound, LlrpCodec};
pub use messages::{
    ConnectionAttemptStatus, LlrpMessage, MessageBody, MessageIdAllocator, ReaderEvent, Timestamp,
};
pub use status::{LlrpStatus, StatusCode};
pub use version::ProtocolVersion;
