// src/session/mod.rs

//! The public LLRP session: lifecycle of the listening endpoint, the
//! background receive loop, and the configuration surface exposed to the
//! owning service.

mod arbiter;
mod client;
mod keepalive;
mod listeners;

pub use arbiter::ConnectionArbiter;
pub use client::ClientSession;
pub use keepalive::{KeepaliveConfig, KeepaliveMonitor};
pub use listeners::{ListenerSet, SessionListener};

use crate::core::metrics;
use crate::core::protocol::{LlrpMessage, MessageIdAllocator, ProtocolVersion};
use crate::core::{Clock, LlrpError};
use crate::transport::MessageTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The single-use start signal for the background receive loop.
enum LoopStart {
    /// The endpoint is confirmed open; begin serving.
    Serve,
    /// The session is closing before the endpoint was confirmed; exit
    /// silently.
    Cancel,
}

struct SessionState {
    arbiter: Option<Arc<ConnectionArbiter>>,
    loop_handle: Option<JoinHandle<()>>,
    start_gate: Option<oneshot::Sender<LoopStart>>,
    server_closed: Option<oneshot::Receiver<()>>,
}

/// An LLRP server session.
///
/// Owns the listening endpoint and the background receive loop, publishes
/// lifecycle notifications to registered [`SessionListener`]s, and pushes
/// every inbound message onto the queue handed out at construction. A
/// session can be reopened after a prior close has fully completed.
pub struct LlrpSession {
    transport: Arc<dyn MessageTransport>,
    bind_addr: SocketAddr,
    version: Arc<parking_lot::RwLock<ProtocolVersion>>,
    keepalive: parking_lot::Mutex<KeepaliveConfig>,
    listeners: ListenerSet,
    clock: Arc<dyn Clock>,
    ids: MessageIdAllocator,
    inbound: mpsc::UnboundedSender<LlrpMessage>,
    state: Mutex<SessionState>,
}

impl LlrpSession {
    /// Builds a session and returns it together with the receiving end of
    /// its inbound message queue.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        bind_addr: SocketAddr,
        version: ProtocolVersion,
        keepalive: KeepaliveConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<LlrpMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            transport,
            bind_addr,
            version: Arc::new(parking_lot::RwLock::new(version)),
            keepalive: parking_lot::Mutex::new(keepalive),
            listeners: ListenerSet::new(),
            clock,
            ids: MessageIdAllocator::new(),
            inbound: inbound_tx,
            state: Mutex::new(SessionState {
                arbiter: None,
                loop_handle: None,
                start_gate: None,
                server_closed: None,
            }),
        };
        (session, inbound_rx)
    }

    /// Opens the listening endpoint and starts serving.
    ///
    /// The receive loop is spawned immediately but only released once the
    /// transport confirms the endpoint within `timeout`; a missing
    /// confirmation is a fatal timeout.
    pub async fn open(&self, timeout: Duration) -> Result<(), LlrpError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut st = self.state.lock().await;
        if st.arbiter.is_some() {
            return Err(LlrpError::InvalidState(
                "session is already open".to_string(),
            ));
        }

        let keepalive = *self.keepalive.lock();
        let (arbiter, opened_rx, closed_rx) = ConnectionArbiter::new(
            self.transport.clone(),
            self.version.clone(),
            keepalive,
            self.listeners.clone(),
            self.clock.clone(),
            self.ids.clone(),
        );
        let (gate_tx, gate_rx) = oneshot::channel();
        let handle = tokio::spawn(Self::run(
            arbiter.clone(),
            gate_rx,
            self.listeners.clone(),
            self.inbound.clone(),
        ));
        st.arbiter = Some(arbiter.clone());
        st.loop_handle = Some(handle);
        st.start_gate = Some(gate_tx);
        st.server_closed = Some(closed_rx);

        if let Err(e) = self
            .transport
            .request_opening_channel(self.bind_addr, arbiter)
            .await
        {
            if let Some(gate) = st.start_gate.take() {
                let _ = gate.send(LoopStart::Cancel);
            }
            st.arbiter = None;
            st.loop_handle = None;
            st.server_closed = None;
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, opened_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(LlrpError::Internal(
                    "server-opened signal was dropped".to_string(),
                ));
            }
            Err(_) => {
                warn!(
                    "Listening endpoint on {} was not confirmed within the open budget.",
                    self.bind_addr
                );
                return Err(LlrpError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
        }

        if let Some(gate) = st.start_gate.take() {
            let _ = gate.send(LoopStart::Serve);
        }
        info!("LLRP session open on {}.", self.bind_addr);
        Ok(())
    }

    /// Closes the session: cancels the receive loop's start gate if it is
    /// still waiting, aborts the arbiter, closes the listening endpoint, and
    /// joins the receive loop, all within one `timeout` budget.
    ///
    /// Closing a session that was never opened is a no-op, and an
    /// already-closed endpoint is tolerated; only a missing close
    /// confirmation within the budget is an error.
    pub async fn close(&self, timeout: Duration) -> Result<(), LlrpError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (arbiter, server_closed, loop_handle) = {
            let mut st = self.state.lock().await;
            if let Some(gate) = st.start_gate.take() {
                let _ = gate.send(LoopStart::Cancel);
            }
            (
                st.arbiter.take(),
                st.server_closed.take(),
                st.loop_handle.take(),
            )
        };

        let Some(arbiter) = arbiter else {
            debug!("Close requested but no listening endpoint is open.");
            return Ok(());
        };

        arbiter.abort(None).await;

        if let Some(listener) = arbiter.listener_channel().await {
            if let Err(e) = self
                .transport
                .request_closing_channel(listener, false)
                .await
            {
                debug!("Listening endpoint {listener} was already closed: {e}");
            }
            if let Some(server_closed) = server_closed {
                // A dropped sender also means the endpoint is gone.
                if tokio::time::timeout_at(deadline, server_closed)
                    .await
                    .is_err()
                {
                    return Err(LlrpError::Timeout {
                        elapsed_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }

        if let Some(mut handle) = loop_handle {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                return Err(LlrpError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
        }

        info!("LLRP session closed.");
        Ok(())
    }

    /// The background receive loop: waits for the start gate, then pumps
    /// messages from the arbiter into the inbound queue until cancellation
    /// or a fault, and finally reports the outcome.
    async fn run(
        arbiter: Arc<ConnectionArbiter>,
        gate: oneshot::Receiver<LoopStart>,
        listeners: ListenerSet,
        sink: mpsc::UnboundedSender<LlrpMessage>,
    ) {
        match gate.await {
            Ok(LoopStart::Serve) => {}
            Ok(LoopStart::Cancel) | Err(_) => {
                debug!("Receive loop cancelled before serving.");
                return;
            }
        }

        listeners.session_opened();
        debug!("Receive loop serving.");

        let fault = loop {
            match arbiter.await_next_message().await {
                Ok(Some(message)) => {
                    metrics::MESSAGES_RECEIVED_TOTAL.inc();
                    if sink.send(message).is_err() {
                        debug!("Inbound queue consumer is gone; stopping receive loop.");
                        break None;
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        if listeners.is_empty() {
            match &fault {
                Some(e) => warn!("Receive loop terminated: {e}"),
                None => info!("Receive loop stopped."),
            }
        } else {
            listeners.session_closed(fault.as_ref());
        }
    }

    /// Sends a message to the connected controlling client.
    pub async fn send(&self, message: LlrpMessage) -> Result<(), LlrpError> {
        let arbiter = self.state.lock().await.arbiter.clone();
        match arbiter {
            Some(arbiter) => arbiter.send(message).await,
            None => Err(LlrpError::InvalidState(
                "session is not open".to_string(),
            )),
        }
    }

    /// Updates the protocol version used to tag subsequent spontaneous
    /// messages. Takes only the version's own lock.
    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        *self.version.write() = version;
        info!("Protocol version set to {version}.");
    }

    pub fn current_version(&self) -> ProtocolVersion {
        *self.version.read()
    }

    /// Updates the keepalive configuration. A zero interval disables
    /// heartbeats. Applies to the live connection, if any, by restarting its
    /// monitor.
    pub async fn set_keepalive(&self, config: KeepaliveConfig) {
        *self.keepalive.lock() = config;
        let arbiter = self.state.lock().await.arbiter.clone();
        if let Some(arbiter) = arbiter {
            arbiter.set_keepalive(config).await;
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) {
        self.listeners.remove(listener);
    }

    /// The locally bound address of the open listening endpoint.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let arbiter = self.state.lock().await.arbiter.clone();
        match arbiter {
            Some(arbiter) => arbiter.listener_addr().await,
            None => None,
        }
    }
}
