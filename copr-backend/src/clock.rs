//! Time source for the control loops.
//!
//! The worker manager reads the clock once per cycle and hands the value down,
//! so tests can drive the loop with [`ManualClock`] instead of wall time.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Wall-clock seconds since the Unix epoch, with sub-second precision.
pub type Timestamp = f64;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in epoch seconds.
    fn now(&self) -> Timestamp;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real time backed by `chrono` and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to; `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration.as_secs_f64();
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.lock() = now;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
