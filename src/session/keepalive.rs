// src/session/keepalive.rs

//! The keepalive monitor: sends periodic heartbeats on behalf of a client
//! session and aborts the connection when one goes unacknowledged.

use crate::core::LlrpError;
use crate::core::metrics;
use crate::session::arbiter::ConnectionArbiter;
use crate::session::client::ClientSession;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Heartbeat configuration for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// The heartbeat interval. Zero disables heartbeats entirely.
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    /// How long `stop` waits for the monitor task to exit.
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl KeepaliveConfig {
    /// A disabled configuration: no heartbeats.
    pub fn disabled() -> Self {
        Self {
            interval: Duration::ZERO,
            stop_timeout: Duration::from_secs(1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

struct MonitorShared {
    /// True until a heartbeat is sent, then false until the peer's
    /// acknowledgment arrives.
    acknowledged: Mutex<bool>,
    stop: CancellationToken,
}

/// Supervises one connection's liveness.
///
/// Every interval: if the previous heartbeat was acknowledged (or none has
/// been sent yet), clear the flag and send the next one. If not, the peer is
/// presumed dead and the arbiter's abort path is invoked with a descriptive
/// fault. The first heartbeat goes out only after the first full interval.
pub struct KeepaliveMonitor {
    shared: Arc<MonitorShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl KeepaliveMonitor {
    /// Starts the monitor cycle for `session`.
    pub fn start(
        config: KeepaliveConfig,
        session: Arc<ClientSession>,
        arbiter: Weak<ConnectionArbiter>,
    ) -> Self {
        let shared = Arc::new(MonitorShared {
            acknowledged: Mutex::new(true),
            stop: CancellationToken::new(),
        });

        let interval = config.interval;
        let interval_ms = interval.as_millis() as u64;
        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_shared.stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let was_acknowledged = {
                    let mut acked = task_shared.acknowledged.lock();
                    let was = *acked;
                    *acked = false;
                    was
                };

                if was_acknowledged {
                    match session.send_keepalive().await {
                        Ok(()) => metrics::KEEPALIVES_SENT_TOTAL.inc(),
                        Err(e) => {
                            debug!(
                                "Failed to send keepalive on channel {}: {e}",
                                session.channel()
                            );
                            break;
                        }
                    }
                } else {
                    let fault = LlrpError::MissingKeepalive { interval_ms };
                    warn!(
                        "Peer on channel {} is presumed dead: {fault}",
                        session.channel()
                    );
                    metrics::KEEPALIVE_TIMEOUTS_TOTAL.inc();
                    if let Some(arbiter) = arbiter.upgrade() {
                        arbiter.abort(Some(fault)).await;
                    }
                    break;
                }
            }
        });

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
            stop_timeout: config.stop_timeout,
        }
    }

    /// Records a heartbeat acknowledgment from the peer. Calling this is the
    /// only way to keep the cycle alive.
    pub fn set_acknowledged(&self, acknowledged: bool) {
        *self.shared.acknowledged.lock() = acknowledged;
    }

    /// Requests termination and waits up to the configured stop timeout for
    /// the monitor task to exit. Safe to call while the task is sleeping or
    /// mid-send.
    pub async fn stop(&self) {
        self.shared.stop.cancel();
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.stop_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    "Keepalive task did not stop within {:?}; aborting it.",
                    self.stop_timeout
                );
                handle.abort();
            }
        }
    }
}
