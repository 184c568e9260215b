// src/session/listeners.rs

//! Lifecycle listener registration and snapshot-based broadcast.

use crate::core::LlrpError;
use crate::transport::{ChannelEvent, DataSentEvent};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callbacks published by the session to the owning service.
///
/// All methods default to no-ops so implementors only override what they
/// observe. Callbacks must not block: they are invoked from the session's
/// I/O paths.
pub trait SessionListener: Send + Sync {
    /// The listening endpoint is open and the receive loop is serving.
    fn session_opened(&self) {}

    /// The receive loop has stopped. `fault` is the terminating error, or
    /// `None` for a clean stop.
    fn session_closed(&self, _fault: Option<&LlrpError>) {}

    /// A controlling client completed its accept handshake.
    fn client_connected(&self, _evt: &ChannelEvent) {}

    /// The controlling client's channel closed.
    fn client_disconnected(&self, _evt: &ChannelEvent) {}

    /// An outbound message was confirmed sent (handshake confirmations are
    /// filtered out).
    fn data_sent(&self, _evt: &DataSentEvent) {}
}

/// A set of registered listeners.
///
/// Broadcast iterates over a snapshot of the registration list, so a
/// callback may add or remove listeners without invalidating the pass that
/// invoked it. Cloning shares the underlying set.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<RwLock<Vec<Arc<dyn SessionListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn SessionListener>) {
        self.inner.write().push(listener);
    }

    /// Removes a previously added listener, matched by identity.
    pub fn remove(&self, listener: &Arc<dyn SessionListener>) {
        self.inner.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.inner.read().clone()
    }

    pub fn session_opened(&self) {
        for listener in self.snapshot() {
            listener.session_opened();
        }
    }

    pub fn session_closed(&self, fault: Option<&LlrpError>) {
        for listener in self.snapshot() {
            listener.session_closed(fault);
        }
    }

    pub fn client_connected(&self, evt: &ChannelEvent) {
        for listener in self.snapshot() {
            listener.client_connected(evt);
        }
    }

    pub fn client_disconnected(&self, evt: &ChannelEvent) {
        for listener in self.snapshot() {
            listener.client_disconnected(evt);
        }
    }

    pub fn data_sent(&self, evt: &DataSentEvent) {
        for listener in self.snapshot() {
            listener.data_sent(evt);
        }
    }
}
