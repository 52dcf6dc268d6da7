//! Clock and sleep abstraction for the dispatcher

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Source of time for debounce, settle and reconnect timing
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Current monotonic time
    fn now(&self) -> Instant;

    /// Suspend for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock scheduler backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub use manual::ManualScheduler;
