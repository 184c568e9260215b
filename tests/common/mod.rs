// tests/common/mod.rs

//! Shared test harness: an in-memory transport the session core drives the
//! same way it drives the TCP transport, plus a listener that records
//! lifecycle notifications.

#![allow(dead_code)] // Each test binary uses a subset of the helpers.

use bytes::Bytes;
use llrpd::core::protocol::{LlrpMessage, MessageBody, ProtocolVersion, Timestamp};
use llrpd::core::{Clock, LlrpError};
use llrpd::session::{KeepaliveConfig, LlrpSession, SessionListener};
use llrpd::transport::{
    ChannelEvent, ChannelEventHandler, ChannelId, ChannelKind, DataSentEvent, MessageTransport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// A clock pinned to a fixed UTC instant.
pub struct FixedClock;

pub const FIXED_MICROS: u64 = 1_700_000_000_000_000;

impl Clock for FixedClock {
    fn timestamp(&self) -> Timestamp {
        Timestamp::Utc(FIXED_MICROS)
    }
}

type InboundItem = Result<LlrpMessage, LlrpError>;

struct MockChannel {
    inbound_tx: mpsc::UnboundedSender<InboundItem>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundItem>>>,
}

#[derive(Default)]
struct MockState {
    handler: Option<Arc<dyn ChannelEventHandler>>,
    channels: HashMap<ChannelId, MockChannel>,
    sent: Vec<(ChannelId, LlrpMessage)>,
    close_requests: Vec<(ChannelId, bool)>,
    listener: Option<ChannelId>,
}

/// An in-memory [`MessageTransport`] with scriptable behavior.
///
/// By default every send is confirmed back through `data_sent`, the
/// listening endpoint confirms immediately, and close requests complete by
/// raising `channel_closed` from a separate task, mirroring the TCP
/// transport's I/O-task callbacks.
pub struct MockTransport {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    /// Fire `data_sent` confirmations automatically for each send.
    pub confirm_sends: AtomicBool,
    /// Confirm the listening endpoint as soon as it is requested.
    pub confirm_opens: AtomicBool,
    /// Complete close requests by closing the channel and firing the
    /// `channel_closed` callback.
    pub close_on_request: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(0),
            confirm_sends: AtomicBool::new(true),
            confirm_opens: AtomicBool::new(true),
            close_on_request: AtomicBool::new(true),
        })
    }

    fn allocate_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn handler(&self) -> Arc<dyn ChannelEventHandler> {
        self.state
            .lock()
            .handler
            .clone()
            .expect("transport has no registered handler; open the session first")
    }

    /// Simulates a client connection attempt. Returns its channel id.
    pub async fn connect_client(&self) -> ChannelId {
        let channel = self.allocate_id();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.state.lock().channels.insert(
            channel,
            MockChannel {
                inbound_tx,
                inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            },
        );
        self.handler()
            .channel_opened(ChannelEvent {
                channel,
                kind: ChannelKind::Client,
                addr: Some("127.0.0.1:49152".parse().unwrap()),
            })
            .await;
        channel
    }

    /// Queues an inbound message on a client channel.
    pub fn push_message(&self, channel: ChannelId, message: LlrpMessage) {
        let st = self.state.lock();
        st.channels[&channel]
            .inbound_tx
            .send(Ok(message))
            .expect("inbound queue is closed");
    }

    /// Queues an inbound fault (e.g. a decode error) on a client channel.
    pub fn push_fault(&self, channel: ChannelId, fault: LlrpError) {
        let st = self.state.lock();
        st.channels[&channel]
            .inbound_tx
            .send(Err(fault))
            .expect("inbound queue is closed");
    }

    /// Simulates the peer disconnecting: closes the channel's inbound queue
    /// and raises the closed callback.
    pub async fn disconnect(&self, channel: ChannelId) {
        let handler = self.handler();
        self.state.lock().channels.remove(&channel);
        handler
            .channel_closed(ChannelEvent {
                channel,
                kind: ChannelKind::Client,
                addr: None,
            })
            .await;
    }

    /// Manually confirms one send (used with `confirm_sends` off).
    pub async fn fire_data_sent(&self, channel: ChannelId, message_id: u32) {
        self.handler()
            .data_sent(DataSentEvent {
                channel,
                message_id,
            })
            .await;
    }

    /// Everything sent on `channel`, in order.
    pub fn sent_to(&self, channel: ChannelId) -> Vec<LlrpMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// All close requests observed, in order.
    pub fn close_requests(&self) -> Vec<(ChannelId, bool)> {
        self.state.lock().close_requests.clone()
    }

    pub fn listener_channel(&self) -> Option<ChannelId> {
        self.state.lock().listener
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn request_opening_channel(
        &self,
        addr: std::net::SocketAddr,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> Result<(), LlrpError> {
        let channel = self.allocate_id();
        {
            let mut st = self.state.lock();
            st.handler = Some(handler.clone());
            st.listener = Some(channel);
        }
        if self.confirm_opens.load(Ordering::SeqCst) {
            handler
                .channel_opened(ChannelEvent {
                    channel,
                    kind: ChannelKind::Listener,
                    addr: Some(addr),
                })
                .await;
        }
        Ok(())
    }

    async fn request_closing_channel(
        &self,
        channel: ChannelId,
        force: bool,
    ) -> Result<(), LlrpError> {
        let handler = {
            let mut st = self.state.lock();
            st.close_requests.push((channel, force));
            st.handler.clone()
        };
        if !self.close_on_request.load(Ordering::SeqCst) {
            return Ok(());
        }

        let is_listener = self.state.lock().listener == Some(channel);
        let (kind, known) = if is_listener {
            self.state.lock().listener = None;
            (ChannelKind::Listener, true)
        } else {
            let known = self.state.lock().channels.remove(&channel).is_some();
            (ChannelKind::Client, known)
        };
        if !known {
            return Err(LlrpError::ChannelGone);
        }

        // Mirror the real transport: the closed callback arrives from an
        // I/O task, never from inside the close request itself.
        if let Some(handler) = handler {
            tokio::spawn(async move {
                handler
                    .channel_closed(ChannelEvent {
                        channel,
                        kind,
                        addr: None,
                    })
                    .await;
            });
        }
        Ok(())
    }

    async fn request_sending_data(
        &self,
        channel: ChannelId,
        message: LlrpMessage,
    ) -> Result<(), LlrpError> {
        let message_id = message.message_id;
        {
            let mut st = self.state.lock();
            if st.listener != Some(channel) && !st.channels.contains_key(&channel) {
                return Err(LlrpError::ChannelGone);
            }
            st.sent.push((channel, message));
        }
        if self.confirm_sends.load(Ordering::SeqCst) {
            self.handler()
                .data_sent(DataSentEvent {
                    channel,
                    message_id,
                })
                .await;
        }
        Ok(())
    }

    async fn await_received_data(
        &self,
        channel: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<LlrpMessage, LlrpError> {
        let inbound = self
            .state
            .lock()
            .channels
            .get(&channel)
            .map(|c| Arc::clone(&c.inbound_rx))
            .ok_or(LlrpError::ChannelGone)?;
        let mut rx = inbound.lock().await;
        let item = match timeout {
            None => rx.recv().await,
            Some(budget) => tokio::time::timeout(budget, rx.recv())
                .await
                .map_err(|_| LlrpError::Timeout {
                    elapsed_ms: budget.as_millis() as u64,
                })?,
        };
        match item {
            Some(Ok(message)) => Ok(message),
            Some(Err(fault)) => Err(fault),
            None => Err(LlrpError::ChannelGone),
        }
    }
}

/// A lifecycle notification observed by [`EventListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Closed(Option<LlrpError>),
    ClientConnected(ChannelId),
    ClientDisconnected(ChannelId),
    DataSent(u32),
}

/// A listener that forwards every notification to an mpsc channel.
pub struct EventListener {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SessionListener for EventListener {
    fn session_opened(&self) {
        let _ = self.tx.send(SessionEvent::Opened);
    }

    fn session_closed(&self, fault: Option<&LlrpError>) {
        let _ = self.tx.send(SessionEvent::Closed(fault.cloned()));
    }

    fn client_connected(&self, evt: &ChannelEvent) {
        let _ = self.tx.send(SessionEvent::ClientConnected(evt.channel));
    }

    fn client_disconnected(&self, evt: &ChannelEvent) {
        let _ = self.tx.send(SessionEvent::ClientDisconnected(evt.channel));
    }

    fn data_sent(&self, evt: &DataSentEvent) {
        let _ = self.tx.send(SessionEvent::DataSent(evt.message_id));
    }
}

/// A fully opened session wired to a mock transport and event listener.
pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub session: Arc<LlrpSession>,
    pub inbound: mpsc::UnboundedReceiver<LlrpMessage>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub const OPEN_BUDGET: Duration = Duration::from_millis(500);

/// Builds and opens a session over a fresh mock transport, consuming the
/// initial `Opened` notification.
pub async fn open_session(keepalive: KeepaliveConfig) -> Harness {
    let transport = MockTransport::new();
    let mut harness = open_session_with(transport, keepalive).await;
    assert_eq!(next_event(&mut harness.events).await, SessionEvent::Opened);
    harness
}

/// Builds and opens a session over the given transport. The `Opened`
/// notification is left in the event queue.
pub async fn open_session_with(
    transport: Arc<MockTransport>,
    keepalive: KeepaliveConfig,
) -> Harness {
    let (session, inbound) = LlrpSession::new(
        transport.clone(),
        "127.0.0.1:5084".parse().unwrap(),
        ProtocolVersion::V1_0_1,
        keepalive,
        Arc::new(FixedClock),
    );
    let session = Arc::new(session);
    let (listener, events) = EventListener::new();
    session.add_listener(listener);
    session.open(OPEN_BUDGET).await.expect("open failed");
    Harness {
        transport,
        session,
        inbound,
        events,
    }
}

/// Polls until at least `count` messages have been sent on `channel`.
pub async fn wait_for_sent(
    transport: &MockTransport,
    channel: ChannelId,
    count: usize,
) -> Vec<LlrpMessage> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let sent = transport.sent_to(channel);
        if sent.len() >= count {
            return sent;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {count} sent messages on {channel}; saw {}",
                sent.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drains all pending lifecycle events and fails on any closure or fault.
pub fn assert_no_fault(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::DataSent(_) => {}
            SessionEvent::Closed(_) | SessionEvent::ClientDisconnected(_) => {
                panic!("unexpected session teardown: {event:?}")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

/// Awaits the next lifecycle event, failing the test after a grace period.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

/// Awaits the next inbound message, failing the test after a grace period.
pub async fn next_message(inbound: &mut mpsc::UnboundedReceiver<LlrpMessage>) -> LlrpMessage {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("timed out waiting for an inbound message")
        .expect("inbound queue closed")
}

/// An opaque application-level request message (ADD_ROSPEC).
pub fn request_message(message_id: u32) -> LlrpMessage {
    LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        message_id,
        MessageBody::Other {
            msg_type: 20,
            payload: Bytes::from_static(b"\x00\x00"),
        },
    )
}

pub fn keepalive_ack(message_id: u32) -> LlrpMessage {
    LlrpMessage::new(ProtocolVersion::V1_0_1, message_id, MessageBody::KeepaliveAck)
}
