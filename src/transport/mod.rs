// src/transport/mod.rs

//! The byte-level transport abstraction the session core is built against.
//!
//! The core never touches sockets directly: it asks a [`MessageTransport`]
//! to open/close channels and send messages, and receives asynchronous
//! channel lifecycle events through a [`ChannelEventHandler`] it registers
//! when the listening endpoint is opened. Tests substitute an in-memory
//! transport; production uses [`tcp::TcpMessageTransport`].

use crate::core::LlrpError;
use crate::core::protocol::LlrpMessage;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod tcp;

pub use tcp::TcpMessageTransport;

/// An opaque identifier for one transport channel (the listening endpoint or
/// a single accepted client connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a channel event concerns the listening endpoint or a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Listener,
    Client,
}

/// A channel lifecycle event.
///
/// For client channels `addr` is the peer address; for the listening
/// endpoint it is the locally bound address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEvent {
    pub channel: ChannelId,
    pub kind: ChannelKind,
    pub addr: Option<SocketAddr>,
}

/// Confirmation that one outbound message has been handed to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSentEvent {
    pub channel: ChannelId,
    pub message_id: u32,
}

/// Receives asynchronous channel events from the transport's I/O tasks.
///
/// The transport guarantees that once `channel_closed` has been delivered
/// for a channel, no further messages for that channel will be produced by
/// `await_received_data`.
#[async_trait]
pub trait ChannelEventHandler: Send + Sync {
    async fn channel_opened(&self, evt: ChannelEvent);
    async fn channel_closed(&self, evt: ChannelEvent);
    async fn data_sent(&self, evt: DataSentEvent);
}

/// The transport operations the session core consumes.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Binds a listening endpoint and registers `handler` for all events on
    /// it and on the client channels it accepts. The endpoint's
    /// `channel_opened` event is the open confirmation.
    async fn request_opening_channel(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> Result<(), LlrpError>;

    /// Requests closure of a channel. A graceful close drains queued
    /// outbound messages first; a forced close tears the channel down
    /// immediately.
    async fn request_closing_channel(&self, channel: ChannelId, force: bool)
    -> Result<(), LlrpError>;

    /// Queues one message for delivery. Its `data_sent` confirmation fires
    /// once the message has been written out.
    async fn request_sending_data(
        &self,
        channel: ChannelId,
        message: LlrpMessage,
    ) -> Result<(), LlrpError>;

    /// Blocks until the next inbound item on `channel` is available.
    /// `timeout: None` waits indefinitely. Malformed frames surface as
    /// `LlrpError::Decode`; a vanished channel as `LlrpError::ChannelGone`.
    async fn await_received_data(
        &self,
        channel: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<LlrpMessage, LlrpError>;
}
