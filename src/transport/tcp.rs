// src/transport/tcp.rs

//! The production TCP transport: a tokio listener plus per-channel read and
//! write tasks, bridged to the session core through the
//! [`ChannelEventHandler`] callbacks.

use crate::core::LlrpError;
use crate::core::protocol::{Inbound, LlrpCodec, LlrpMessage};
use crate::transport::{
    ChannelEvent, ChannelEventHandler, ChannelId, ChannelKind, DataSentEvent, MessageTransport,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An item queued for the write task.
enum Outgoing {
    Message(LlrpMessage),
    /// Drain the queue, shut the socket down, then tear the channel down.
    Close,
}

struct ClientChannel {
    outbound: mpsc::UnboundedSender<Outgoing>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<Inbound>>>,
    cancel: CancellationToken,
}

struct ListenerChannel {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

/// The shared channel registry; per-channel tasks keep it alive.
#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    clients: DashMap<ChannelId, ClientChannel>,
    listeners: DashMap<ChannelId, ListenerChannel>,
}

/// A [`MessageTransport`] over plain TCP. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct TcpMessageTransport {
    registry: Arc<Registry>,
}

impl TcpMessageTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The locally bound address of an open listening endpoint.
    pub fn listener_addr(&self, channel: ChannelId) -> Option<SocketAddr> {
        self.registry.listeners.get(&channel).map(|l| l.local_addr)
    }
}

impl Registry {
    fn allocate_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn spawn_client(
        self: &Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> ChannelId {
        let channel = self.allocate_id();
        let (read_half, write_half) = socket.into_split();
        let mut reader = FramedRead::new(read_half, LlrpCodec);
        let mut writer = FramedWrite::new(write_half, LlrpCodec);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let cancel = CancellationToken::new();

        self.clients.insert(
            channel,
            ClientChannel {
                outbound: outbound_tx,
                inbound: Arc::new(Mutex::new(inbound_rx)),
                cancel: cancel.clone(),
            },
        );

        // Write task: confirms each successful send back to the handler.
        let write_cancel = cancel.clone();
        let write_handler = handler.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = write_cancel.cancelled() => break,
                    item = outbound_rx.recv() => match item {
                        Some(Outgoing::Message(msg)) => {
                            let message_id = msg.message_id;
                            if let Err(e) = writer.send(msg).await {
                                warn!("Write on channel {channel} failed: {e}");
                                write_cancel.cancel();
                                break;
                            }
                            write_handler
                                .data_sent(DataSentEvent {
                                    channel,
                                    message_id,
                                })
                                .await;
                        }
                        Some(Outgoing::Close) | None => {
                            if let Err(e) = writer.close().await {
                                debug!("Shutdown of channel {channel} failed: {e}");
                            }
                            write_cancel.cancel();
                            break;
                        }
                    },
                }
            }
        });

        // Read task: owns channel teardown. The inbound queue is closed and
        // the channel deregistered before the closed callback fires, so no
        // receive can produce data for a channel whose closure was reported.
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = reader.next() => match item {
                        Some(Ok(inbound)) => {
                            if inbound_tx.send(inbound).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Receive on channel {channel} failed: {e}");
                            break;
                        }
                        None => {
                            debug!("Channel {channel} closed by peer {peer}.");
                            break;
                        }
                    },
                }
            }
            cancel.cancel();
            drop(inbound_tx);
            registry.clients.remove(&channel);
            handler
                .channel_closed(ChannelEvent {
                    channel,
                    kind: ChannelKind::Client,
                    addr: Some(peer),
                })
                .await;
        });

        channel
    }
}

#[async_trait]
impl MessageTransport for TcpMessageTransport {
    async fn request_opening_channel(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn ChannelEventHandler>,
    ) -> Result<(), LlrpError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let channel = self.registry.allocate_id();
        let cancel = CancellationToken::new();
        self.registry.listeners.insert(
            channel,
            ListenerChannel {
                cancel: cancel.clone(),
                local_addr,
            },
        );
        info!("Listening for LLRP clients on {local_addr}");

        handler
            .channel_opened(ChannelEvent {
                channel,
                kind: ChannelKind::Listener,
                addr: Some(local_addr),
            })
            .await;

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((socket, peer)) => {
                            info!("Accepted new connection from: {peer}");
                            let client = registry.spawn_client(socket, peer, handler.clone());
                            handler
                                .channel_opened(ChannelEvent {
                                    channel: client,
                                    kind: ChannelKind::Client,
                                    addr: Some(peer),
                                })
                                .await;
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                        }
                    },
                }
            }
            drop(listener);
            registry.listeners.remove(&channel);
            handler
                .channel_closed(ChannelEvent {
                    channel,
                    kind: ChannelKind::Listener,
                    addr: Some(local_addr),
                })
                .await;
        });

        Ok(())
    }

    async fn request_closing_channel(
        &self,
        channel: ChannelId,
        force: bool,
    ) -> Result<(), LlrpError> {
        if let Some(listener) = self.registry.listeners.get(&channel) {
            listener.cancel.cancel();
            return Ok(());
        }
        let Some(client) = self.registry.clients.get(&channel) else {
            return Err(LlrpError::ChannelGone);
        };
        if force {
            client.cancel.cancel();
        } else if client.outbound.send(Outgoing::Close).is_err() {
            // Write task already gone; fall back to immediate teardown.
            client.cancel.cancel();
        }
        Ok(())
    }

    async fn request_sending_data(
        &self,
        channel: ChannelId,
        message: LlrpMessage,
    ) -> Result<(), LlrpError> {
        let client = self
            .registry
            .clients
            .get(&channel)
            .ok_or(LlrpError::ChannelGone)?;
        client
            .outbound
            .send(Outgoing::Message(message))
            .map_err(|_| LlrpError::ChannelGone)
    }

    async fn await_received_data(
        &self,
        channel: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<LlrpMessage, LlrpError> {
        let inbound = self
            .registry
            .clients
            .get(&channel)
            .map(|c| Arc::clone(&c.inbound))
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
            Some(Inbound::Message(msg)) => Ok(msg),
            Some(Inbound::Malformed(fault)) => Err(LlrpError::Decode(fault)),
            None => Err(LlrpError::ChannelGone),
        }
    }
}
