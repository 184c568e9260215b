// src/session/client.rs

//! The per-connection session: message exchange with the one accepted
//! client, and the throwaway sender used to turn away everybody else.

use crate::core::errors::{DecodeError, LlrpError};
use crate::core::metrics;
use crate::core::protocol::{
    ConnectionAttemptStatus, LlrpMessage, LlrpStatus, MessageBody, MessageIdAllocator,
    ProtocolVersion, ReaderEvent,
};
use crate::core::Clock;
use crate::session::arbiter::{AbortCell, ConnectionArbiter};
use crate::session::keepalive::{KeepaliveConfig, KeepaliveMonitor};
use crate::transport::{ChannelId, DataSentEvent, MessageTransport};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Owns the exchange with one accepted client connection.
///
/// Constructed for exactly one connection and never reused: a replacement
/// connection gets a fresh session.
pub struct ClientSession {
    channel: ChannelId,
    transport: Arc<dyn MessageTransport>,
    /// The session's protocol version. Guarded by its own lock, independent
    /// of the admission lock: configuration may change it mid-session from a
    /// different control path.
    version: Arc<RwLock<ProtocolVersion>>,
    abort: Arc<AbortCell>,
    /// Set once a CLOSE_CONNECTION_RESPONSE has gone out, so teardown does
    /// not also send a close notification.
    close_response_sent: AtomicBool,
    clock: Arc<dyn Clock>,
    ids: MessageIdAllocator,
    keepalive: tokio::sync::Mutex<Option<KeepaliveMonitor>>,
    /// Message id of an unconfirmed acceptance notification; its `data_sent`
    /// confirmation is swallowed instead of forwarded to listeners.
    pending_confirmation: Mutex<Option<u32>>,
}

impl ClientSession {
    pub fn new(
        channel: ChannelId,
        transport: Arc<dyn MessageTransport>,
        version: Arc<RwLock<ProtocolVersion>>,
        abort: Arc<AbortCell>,
        clock: Arc<dyn Clock>,
        ids: MessageIdAllocator,
    ) -> Self {
        Self {
            channel,
            transport,
            version,
            abort,
            close_response_sent: AtomicBool::new(false),
            clock,
            ids,
            keepalive: tokio::sync::Mutex::new(None),
            pending_confirmation: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn current_version(&self) -> ProtocolVersion {
        *self.version.read()
    }

    pub fn close_response_sent(&self) -> bool {
        self.close_response_sent.load(Ordering::SeqCst)
    }

    /// Forwards a message to the transport. A successfully queued
    /// CLOSE_CONNECTION_RESPONSE marks the close response as in flight.
    pub async fn send(&self, message: LlrpMessage) -> Result<(), LlrpError> {
        let is_close_response =
            matches!(message.body, MessageBody::CloseConnectionResponse { .. });
        self.transport
            .request_sending_data(self.channel, message)
            .await?;
        if is_close_response {
            self.close_response_sent.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn send_keepalive(&self) -> Result<(), LlrpError> {
        let message = LlrpMessage::new(
            self.current_version(),
            self.ids.next_id(),
            MessageBody::Keepalive,
        );
        self.send(message).await
    }

    /// Sends the CONNECTION_ATTEMPT Success notification and arms the
    /// one-shot confirmation filter for it.
    pub async fn send_acceptance(&self) -> Result<(), LlrpError> {
        let message_id = self.ids.next_id();
        let message = LlrpMessage::new(
            self.current_version(),
            message_id,
            MessageBody::ReaderEventNotification {
                timestamp: self.clock.timestamp(),
                event: ReaderEvent::ConnectionAttempt(ConnectionAttemptStatus::Success),
            },
        );
        *self.pending_confirmation.lock() = Some(message_id);
        self.send(message).await
    }

    /// Sends the CONNECTION_CLOSE notification, tagged with the current
    /// protocol version.
    pub async fn send_close_notification(&self) -> Result<(), LlrpError> {
        let message = LlrpMessage::new(
            self.current_version(),
            self.ids.next_id(),
            MessageBody::ReaderEventNotification {
                timestamp: self.clock.timestamp(),
                event: ReaderEvent::ConnectionClose,
            },
        );
        self.send(message).await
    }

    /// Answers one malformed inbound frame with an ERROR_MESSAGE carrying
    /// the mapped status code.
    async fn send_error_reply(&self, fault: &DecodeError) -> Result<(), LlrpError> {
        let status = fault.status_code();
        let status_label = status.to_string();
        metrics::ERROR_REPLIES_TOTAL
            .with_label_values(&[status_label.as_str()])
            .inc();
        let message = LlrpMessage::new(
            self.current_version(),
            fault.message_id(),
            MessageBody::ErrorMessage {
                status: LlrpStatus::new(status, fault.to_string()),
            },
        );
        self.send(message).await
    }

    /// Filters one send confirmation. Returns true when the event was the
    /// armed handshake confirmation, which is swallowed rather than
    /// forwarded to listeners.
    pub fn data_sent(&self, evt: &DataSentEvent) -> bool {
        let mut pending = self.pending_confirmation.lock();
        if *pending == Some(evt.message_id) {
            *pending = None;
            true
        } else {
            false
        }
    }

    /// Blocks until the next message for the owning service is available.
    ///
    /// Heartbeat acknowledgments are consumed here and never returned.
    /// Malformed frames are answered with an error reply and the receive
    /// continues: a decode fault never tears the connection down. A
    /// channel-gone fault during an abort is a clean cancellation
    /// (`Ok(None)`, or the captured abort cause when one exists).
    pub async fn receive_next(&self) -> Result<Option<LlrpMessage>, LlrpError> {
        loop {
            match self.transport.await_received_data(self.channel, None).await {
                Ok(message) => {
                    if matches!(message.body, MessageBody::KeepaliveAck) {
                        debug!(
                            "Keepalive acknowledged by peer on channel {}.",
                            self.channel
                        );
                        if let Some(monitor) = self.keepalive.lock().await.as_ref() {
                            monitor.set_acknowledged(true);
                        }
                        continue;
                    }
                    return Ok(Some(message));
                }
                Err(LlrpError::Decode(fault)) => {
                    warn!(
                        "Malformed message on channel {}: {fault}. Replying with {}.",
                        self.channel,
                        fault.status_code()
                    );
                    if let Err(e) = self.send_error_reply(&fault).await {
                        self.stop_keepalive().await;
                        return Err(e);
                    }
                }
                Err(LlrpError::ChannelGone) => {
                    if let Some(cause) = self.abort.cause() {
                        return Err(cause);
                    }
                    if self.abort.is_set() {
                        return Ok(None);
                    }
                    return Err(LlrpError::ChannelGone);
                }
                Err(e) => {
                    self.stop_keepalive().await;
                    return Err(e);
                }
            }
        }
    }

    /// Replaces the keepalive monitor: any running one is stopped, and a new
    /// one is started only when the interval is non-zero.
    pub async fn apply_keepalive(
        session: &Arc<Self>,
        config: KeepaliveConfig,
        arbiter: Weak<ConnectionArbiter>,
    ) {
        let mut guard = session.keepalive.lock().await;
        if let Some(old) = guard.take() {
            old.stop().await;
        }
        if config.is_enabled() {
            *guard = Some(KeepaliveMonitor::start(config, session.clone(), arbiter));
        }
    }

    /// Stops a running keepalive monitor, if any.
    pub async fn stop_keepalive(&self) {
        let monitor = self.keepalive.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }
}

/// A throwaway sender for a connection attempt that lost the admission
/// race: it sends the denial notification and is discarded. It never
/// becomes the active connection and its events are invisible to lifecycle
/// listeners.
pub(crate) struct DeniedClient {
    channel: ChannelId,
    transport: Arc<dyn MessageTransport>,
    version: ProtocolVersion,
    clock: Arc<dyn Clock>,
    ids: MessageIdAllocator,
}

impl DeniedClient {
    pub(crate) fn new(
        channel: ChannelId,
        transport: Arc<dyn MessageTransport>,
        version: ProtocolVersion,
        clock: Arc<dyn Clock>,
        ids: MessageIdAllocator,
    ) -> Self {
        Self {
            channel,
            transport,
            version,
            clock,
            ids,
        }
    }

    pub(crate) async fn send_denial(&self) -> Result<(), LlrpError> {
        let message = LlrpMessage::new(
            self.version,
            self.ids.next_id(),
            MessageBody::ReaderEventNotification {
                timestamp: self.clock.timestamp(),
                event: ReaderEvent::ConnectionAttempt(
                    ConnectionAttemptStatus::FailedClientConnectionExists,
                ),
            },
        );
        self.transport
            .request_sending_data(self.channel, message)
            .await
    }
}
