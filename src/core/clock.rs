// src/core/clock.rs

//! The platform clock capability used to timestamp spontaneous notifications.

use crate::core::protocol::Timestamp;
use std::time::Instant;

/// A source of notification timestamps.
///
/// Injected into the session rather than read from a global so tests can pin
/// time.
pub trait Clock: Send + Sync {
    fn timestamp(&self) -> Timestamp;
}

/// The production clock: UTC microseconds when the system clock is usable,
/// monotonic uptime microseconds otherwise.
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn timestamp(&self) -> Timestamp {
        let micros = chrono::Utc::now().timestamp_micros();
        if micros >= 0 {
            Timestamp::Utc(micros as u64)
        } else {
            // System clock is set before the epoch; fall back to uptime.
            Timestamp::Uptime(self.started.elapsed().as_micros() as u64)
        }
    }
}
