//! Bounded polling policy shared by every wait loop.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed-interval poll with an attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
        }
    }

    /// Zero-delay policy, used by tests.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(0, max_attempts)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval() * self.max_attempts.saturating_sub(1)
    }

    /// Run `check` until it returns true or the attempts are exhausted.
    ///
    /// Returns the 1-based attempt that succeeded.
    pub async fn wait_until<F>(&self, mut check: F) -> Option<u32>
    where
        F: FnMut() -> bool,
    {
        self.wait_until_async(|| std::future::ready(check())).await
    }

    /// Async flavour of [`PollPolicy::wait_until`].
    pub async fn wait_until_async<F, Fut>(&self, mut check: F) -> Option<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.max_attempts {
            if check().await {
                return Some(attempt);
            }
            if attempt < self.max_attempts {
                self.sleep().await;
            }
        }
        None
    }

    pub async fn sleep(&self) {
        if self.interval_ms > 0 {
            tokio::time::sleep(self.interval()).await;
        }
    }
}
