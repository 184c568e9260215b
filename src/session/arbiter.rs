// src/session/arbiter.rs

//! The admission arbiter: decides which connection attempt becomes the one
//! controlling client, bridges transport events into session state, and
//! exposes the blocking next-message operation to the receive loop.

use crate::core::errors::LlrpError;
use crate::core::metrics;
use crate::core::protocol::{LlrpMessage, MessageIdAllocator, ProtocolVersion};
use crate::core::Clock;
use crate::session::client::{ClientSession, DeniedClient};
use crate::session::keepalive::KeepaliveConfig;
use crate::session::listeners::ListenerSet;
use crate::transport::{
    ChannelEvent, ChannelEventHandler, ChannelId, ChannelKind, DataSentEvent, MessageTransport,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, oneshot};
use tracing::{debug, info, warn};

/// How long a denied channel may linger before its bookkeeping entry is
/// dropped and the channel force-closed. Bounds the case of a transport
/// that never raises the close callback for a denied channel.
const DENIAL_CLEANUP_AFTER: Duration = Duration::from_secs(30);

/// The terminal cancellation record for one arbiter lifetime.
///
/// Set at most once, by explicit cancellation (no cause) or by a fault (the
/// cause is captured); never cleared. A reopened session builds a fresh
/// arbiter and with it a fresh cell.
#[derive(Default)]
pub struct AbortCell {
    slot: RwLock<Option<Option<LlrpError>>>,
}

impl AbortCell {
    /// Records the abort. Returns false when the cell was already set.
    pub(crate) fn set(&self, cause: Option<LlrpError>) -> bool {
        let mut slot = self.slot.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        true
    }

    pub(crate) fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }

    /// The captured fault, when the abort carried one.
    pub(crate) fn cause(&self) -> Option<LlrpError> {
        self.slot.read().as_ref().and_then(|c| c.clone())
    }
}

/// The currently admitted client connection.
struct ActiveClient {
    channel: ChannelId,
    peer: Option<SocketAddr>,
    session: Arc<ClientSession>,
    /// True from admission until the acceptance notification's delivery is
    /// confirmed; the receive loop cannot observe the client before then.
    handshake_pending: bool,
}

struct ArbiterState {
    client: Option<ActiveClient>,
    denied: HashSet<ChannelId>,
    listener: Option<(ChannelId, Option<SocketAddr>)>,
    server_opened: Option<oneshot::Sender<()>>,
    server_closed: Option<oneshot::Sender<()>>,
    keepalive: KeepaliveConfig,
}

/// Admission policy and event bridge for one open/close cycle of the
/// listening endpoint.
///
/// Exactly one connection attempt is admitted at a time; every other
/// attempt receives a denial notification and is closed without ever
/// becoming visible to lifecycle listeners.
pub struct ConnectionArbiter {
    transport: Arc<dyn MessageTransport>,
    version: Arc<RwLock<ProtocolVersion>>,
    clock: Arc<dyn Clock>,
    ids: MessageIdAllocator,
    listeners: ListenerSet,
    abort: Arc<AbortCell>,
    state: Mutex<ArbiterState>,
    /// Wakes `await_next_message` on admission progress and on abort.
    wake: Notify,
    self_ref: Weak<ConnectionArbiter>,
}

impl ConnectionArbiter {
    /// Builds an arbiter plus the single-use receivers for its
    /// server-opened and server-closed rendezvous points.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        version: Arc<RwLock<ProtocolVersion>>,
        keepalive: KeepaliveConfig,
        listeners: ListenerSet,
        clock: Arc<dyn Clock>,
        ids: MessageIdAllocator,
    ) -> (Arc<Self>, oneshot::Receiver<()>, oneshot::Receiver<()>) {
        let (opened_tx, opened_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let arbiter = Arc::new_cyclic(|self_ref| Self {
            transport,
            version,
            clock,
            ids,
            listeners,
            abort: Arc::new(AbortCell::default()),
            state: Mutex::new(ArbiterState {
                client: None,
                denied: HashSet::new(),
                listener: None,
                server_opened: Some(opened_tx),
                server_closed: Some(closed_tx),
                keepalive,
            }),
            wake: Notify::new(),
            self_ref: self_ref.clone(),
        });
        (arbiter, opened_rx, closed_rx)
    }

    /// The open listening endpoint, if any.
    pub async fn listener_channel(&self) -> Option<ChannelId> {
        self.state.lock().await.listener.map(|(channel, _)| channel)
    }

    /// The locally bound address of the listening endpoint, if open.
    pub async fn listener_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.listener.and_then(|(_, addr)| addr)
    }

    /// Applies a keepalive configuration change to future admissions and to
    /// the live client, if one exists.
    pub async fn set_keepalive(&self, config: KeepaliveConfig) {
        let session = {
            let mut st = self.state.lock().await;
            st.keepalive = config;
            st.client.as_ref().map(|c| c.session.clone())
        };
        if let Some(session) = session {
            ClientSession::apply_keepalive(&session, config, self.self_ref.clone()).await;
        }
    }

    /// Sends a message to the admitted client.
    pub async fn send(&self, message: LlrpMessage) -> Result<(), LlrpError> {
        let session = {
            let st = self.state.lock().await;
            match &st.client {
                Some(c) if !c.handshake_pending => c.session.clone(),
                _ => {
                    return Err(LlrpError::InvalidState(
                        "no controlling client is connected".to_string(),
                    ));
                }
            }
        };
        session.send(message).await
    }

    /// Blocks until the next inbound message is available.
    ///
    /// Waits for a client whose handshake has completed, re-checking the
    /// abort cell on every wake: a new admission can race in after a close.
    /// Returns `Ok(None)` when the session was cancelled without a fault.
    pub async fn await_next_message(&self) -> Result<Option<LlrpMessage>, LlrpError> {
        loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            // Register for wakeups before inspecting state, so a notify
            // landing between the check and the await is not lost.
            wake.as_mut().enable();

            let session = {
                let st = self.state.lock().await;
                if self.abort.is_set() {
                    return match self.abort.cause() {
                        Some(cause) => Err(cause),
                        None => Ok(None),
                    };
                }
                match &st.client {
                    Some(c) if !c.handshake_pending => Some(c.session.clone()),
                    _ => None,
                }
            };

            if let Some(session) = session {
                return match session.receive_next().await {
                    Err(LlrpError::ChannelGone) if self.abort.is_set() => {
                        match self.abort.cause() {
                            Some(cause) => Err(cause),
                            None => Ok(None),
                        }
                    }
                    other => other,
                };
            }

            wake.await;
        }
    }

    /// Cancels the session (no cause) or aborts it with a fault. Idempotent:
    /// only the first call has any effect. Releases any blocked
    /// `await_next_message` caller; a live client receives a close
    /// notification first unless a close response is already in flight.
    pub async fn abort(&self, cause: Option<LlrpError>) {
        if !self.abort.set(cause.clone()) {
            return;
        }
        match &cause {
            Some(fault) => warn!("Aborting session: {fault}"),
            None => debug!("Cancelling session."),
        }

        let client = {
            let st = self.state.lock().await;
            st.client.as_ref().map(|c| (c.channel, c.session.clone()))
        };
        if let Some((channel, session)) = client {
            if !session.close_response_sent() {
                if let Err(e) = session.send_close_notification().await {
                    debug!("Failed to send close notification on channel {channel}: {e}");
                }
            }
            let force = cause.is_some();
            if let Err(e) = self.transport.request_closing_channel(channel, force).await {
                debug!("Failed to request close of channel {channel}: {e}");
            }
        }
        self.wake.notify_waiters();
    }

    /// Turns away a connection attempt that lost the admission race.
    async fn deny(&self, evt: ChannelEvent) {
        metrics::CONNECTIONS_DENIED_TOTAL.inc();
        info!(
            "Denying connection attempt on channel {}: a client is already connected.",
            evt.channel
        );

        // Bound the bookkeeping: if the transport never raises the close
        // callback for this channel, drop the entry and force the close
        // ourselves.
        let arbiter = self.self_ref.clone();
        let channel = evt.channel;
        tokio::spawn(async move {
            tokio::time::sleep(DENIAL_CLEANUP_AFTER).await;
            if let Some(arbiter) = arbiter.upgrade() {
                let leaked = arbiter.state.lock().await.denied.remove(&channel);
                if leaked {
                    warn!("Denied channel {channel} never reported closure; forcing close.");
                    let _ = arbiter.transport.request_closing_channel(channel, true).await;
                }
            }
        });

        let denied = DeniedClient::new(
            evt.channel,
            self.transport.clone(),
            *self.version.read(),
            self.clock.clone(),
            self.ids.clone(),
        );
        if let Err(e) = denied.send_denial().await {
            debug!("Failed to send denial on channel {}: {e}", evt.channel);
        }
        if let Err(e) = self
            .transport
            .request_closing_channel(evt.channel, false)
            .await
        {
            debug!("Failed to request close of denied channel {}: {e}", evt.channel);
        }
    }

    /// Finishes an admission: starts the keepalive monitor and sends the
    /// acceptance notification. The client slot was already claimed under
    /// the admission lock.
    async fn admit(&self, evt: ChannelEvent, session: Arc<ClientSession>, keepalive: KeepaliveConfig) {
        metrics::CONNECTIONS_ACCEPTED_TOTAL.inc();
        info!(
            "Admitting controlling client {} on channel {}.",
            evt.addr.map_or_else(|| "<unknown>".to_string(), |a| a.to_string()),
            evt.channel
        );

        ClientSession::apply_keepalive(&session, keepalive, self.self_ref.clone()).await;

        if let Err(e) = session.send_acceptance().await {
            warn!(
                "Failed to send connection acceptance on channel {}: {e}",
                evt.channel
            );
            let _ = self
                .transport
                .request_closing_channel(evt.channel, true)
                .await;
        }
    }
}

#[async_trait]
impl ChannelEventHandler for ConnectionArbiter {
    async fn channel_opened(&self, evt: ChannelEvent) {
        if evt.kind == ChannelKind::Listener {
            let mut st = self.state.lock().await;
            st.listener = Some((evt.channel, evt.addr));
            if let Some(opened) = st.server_opened.take() {
                let _ = opened.send(());
            }
            return;
        }

        if self.abort.is_set() {
            debug!(
                "Ignoring connection attempt on channel {} after abort.",
                evt.channel
            );
            return;
        }

        // The admission decision and the claiming of the client slot happen
        // in one critical section so concurrent attempts cannot both win.
        let decision = {
            let mut st = self.state.lock().await;
            if self.abort.is_set() {
                return;
            }
            if st.client.is_some() {
                st.denied.insert(evt.channel);
                None
            } else {
                let session = Arc::new(ClientSession::new(
                    evt.channel,
                    self.transport.clone(),
                    self.version.clone(),
                    self.abort.clone(),
                    self.clock.clone(),
                    self.ids.clone(),
                ));
                st.client = Some(ActiveClient {
                    channel: evt.channel,
                    peer: evt.addr,
                    session: session.clone(),
                    handshake_pending: true,
                });
                Some((session, st.keepalive))
            }
        };

        match decision {
            None => self.deny(evt).await,
            Some((session, keepalive)) => self.admit(evt, session, keepalive).await,
        }
    }

    async fn data_sent(&self, evt: DataSentEvent) {
        let (session, was_pending, peer) = {
            let st = self.state.lock().await;
            match &st.client {
                Some(c) if c.channel == evt.channel => {
                    (c.session.clone(), c.handshake_pending, c.peer)
                }
                // Denied and unknown channels are invisible to listeners.
                _ => return,
            }
        };

        let swallowed = session.data_sent(&evt);
        if was_pending {
            // The opened notification must precede anything the receive
            // loop can deliver, so it fires before the handshake clears.
            metrics::CLIENT_CONNECTED.set(1.0);
            self.listeners.client_connected(&ChannelEvent {
                channel: evt.channel,
                kind: ChannelKind::Client,
                addr: peer,
            });
            {
                let mut st = self.state.lock().await;
                if let Some(c) = st.client.as_mut()
                    && c.channel == evt.channel
                {
                    c.handshake_pending = false;
                }
            }
            self.wake.notify_waiters();
        } else if !swallowed {
            self.listeners.data_sent(&evt);
        }
    }

    async fn channel_closed(&self, evt: ChannelEvent) {
        if evt.kind == ChannelKind::Listener {
            let mut st = self.state.lock().await;
            st.listener = None;
            if let Some(closed) = st.server_closed.take() {
                let _ = closed.send(());
            }
            return;
        }

        let removed = {
            let mut st = self.state.lock().await;
            if let Some(client) = st.client.take_if(|c| c.channel == evt.channel) {
                Some(client)
            } else {
                if st.denied.remove(&evt.channel) {
                    debug!("Denied channel {} finished closing.", evt.channel);
                }
                None
            }
        };

        if let Some(client) = removed {
            client.session.stop_keepalive().await;
            metrics::CLIENT_CONNECTED.set(0.0);
            info!("Controlling client on channel {} disconnected.", evt.channel);
            self.listeners.client_disconnected(&evt);
            self.wake.notify_waiters();
        }
    }
}
