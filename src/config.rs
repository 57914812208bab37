//! Owned bridge configuration.
//!
//! No ambient or process-wide state: a [`BridgeConfig`] is constructed
//! explicitly (env-overridable defaults) and handed to the components
//! that need it.

use std::env;
use std::time::Duration;

/// Tuning for the consumer-side poll loop.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum wall-clock wait for the first output record. A job that
    /// stays `IN_QUEUE`/`IN_PROGRESS` with nothing to show past this
    /// bound is reported as timed out, not retried.
    pub queue_wait: Duration,
    /// Maximum stretch of no-progress polls once output has started.
    pub idle_timeout: Duration,
    /// Pause between polls that returned no new output while the job
    /// is in progress. `IN_QUEUE` polls are not paced; they only count
    /// against `queue_wait`.
    pub poll_interval: Duration,
    /// Transient poll failures tolerated per poll before giving up.
    pub max_poll_retries: u32,
    /// Backoff bounds for poll retries.
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_wait: Duration::from_secs(env_u64("RUNBRIDGE_QUEUE_WAIT_SECS", 30)),
            idle_timeout: Duration::from_secs(env_u64("RUNBRIDGE_IDLE_TIMEOUT_SECS", 90)),
            poll_interval: Duration::from_millis(env_u64("RUNBRIDGE_POLL_INTERVAL_MS", 100)),
            max_poll_retries: env_u64("RUNBRIDGE_MAX_POLL_RETRIES", 3) as u32,
            retry_min_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    pub fn with_queue_wait(mut self, bound: Duration) -> Self {
        self.queue_wait = bound;
        self
    }

    pub fn with_idle_timeout(mut self, bound: Duration) -> Self {
        self.idle_timeout = bound;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_retries(mut self, retries: u32) -> Self {
        self.max_poll_retries = retries;
        self
    }

    /// Exponential backoff for poll retry `attempt` (0-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_min_delay.as_millis() as u64;
        let cap = self.retry_max_delay.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
        Duration::from_millis(delay)
    }
}
