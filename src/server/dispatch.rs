// src/server/dispatch.rs

//! The built-in consumer of the inbound message queue.
//!
//! Handles the protocol-management requests the session core itself does
//! not answer: version negotiation and connection close. Everything else is
//! the business of an embedding application and is only logged here.

use crate::config::Config;
use crate::core::protocol::{LlrpMessage, LlrpStatus, MessageBody, ProtocolVersion};
use crate::session::LlrpSession;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Consumes inbound messages until shutdown or queue closure.
pub async fn run(
    session: Arc<LlrpSession>,
    mut inbound: mpsc::UnboundedReceiver<LlrpMessage>,
    config: Config,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("Dispatcher received shutdown signal.");
                break;
            }
            message = inbound.recv() => match message {
                Some(message) => handle_message(&session, &config, message).await,
                None => break,
            },
        }
    }
}

async fn handle_message(session: &Arc<LlrpSession>, config: &Config, message: LlrpMessage) {
    debug!(
        "Dispatching inbound message type {} (id {}).",
        message.msg_type(),
        message.message_id
    );

    match message.body {
        MessageBody::GetSupportedVersion => {
            let reply = LlrpMessage::new(
                session.current_version(),
                message.message_id,
                MessageBody::GetSupportedVersionResponse {
                    current: session.current_version(),
                    supported: ProtocolVersion::MAX_SUPPORTED,
                    status: LlrpStatus::success(),
                },
            );
            if let Err(e) = session.send(reply).await {
                warn!("Failed to answer GET_SUPPORTED_VERSION: {e}");
            }
        }
        MessageBody::SetProtocolVersion { version } => {
            session.set_protocol_version(version);
            let reply = LlrpMessage::new(
                version,
                message.message_id,
                MessageBody::SetProtocolVersionResponse {
                    status: LlrpStatus::success(),
                },
            );
            if let Err(e) = session.send(reply).await {
                warn!("Failed to answer SET_PROTOCOL_VERSION: {e}");
            }
        }
        MessageBody::CloseConnection => {
            info!("Client requested connection close.");
            let reply = LlrpMessage::new(
                session.current_version(),
                message.message_id,
                MessageBody::CloseConnectionResponse {
                    status: LlrpStatus::success(),
                },
            );
            if let Err(e) = session.send(reply).await {
                warn!("Failed to answer CLOSE_CONNECTION: {e}");
            }
            // Restart the session to await the next controlling client.
            if let Err(e) = session.close(config.close_timeout).await {
                warn!("Session close after CLOSE_CONNECTION failed: {e}");
            } else if let Err(e) = session.open(config.open_timeout).await {
                warn!("Session could not be reopened after CLOSE_CONNECTION: {e}");
            }
        }
        MessageBody::Other { msg_type, .. } => {
            debug!(
                "No built-in handler for message type {msg_type} (id {}); ignoring.",
                message.message_id
            );
        }
        other => {
            debug!(
                "Ignoring unexpected inbound message {:?} (id {}).",
                other.msg_type(),
                message.message_id
            );
        }
    }
}
