//! Session and reconnection configuration

use cartcall_transport::ConnectConfig;
use std::time::Duration;

/// Reconnection backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of reconnect attempts per outage
    pub max_retries: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Largest jitter added, as a fraction of the un-jittered delay
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed).
    ///
    /// `jitter` is a sample in `[0, 1)`. Delays are non-decreasing in
    /// `attempt` as long as `jitter_ratio < backoff_multiplier - 1`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let base =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let jittered = base + base * self.jitter_ratio * jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// Session orchestrator configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How to reach the transport
    pub connect: ConnectConfig,
    /// Reconnection policy
    pub retry: RetryConfig,
    /// Silence on the transport after which connection health is probed
    pub idle_timeout: Duration,
    /// How long a health probe may take
    pub probe_timeout: Duration,
    /// How long a connect attempt may take to report `ConnectionUp`
    pub connect_timeout: Duration,
    /// Uptime after which the consecutive-failure counter resets
    pub stability_window: Duration,
    /// Minimum spacing between coalesced snapshots
    pub coalesce_interval: Duration,
    /// End the call once an order has been placed
    pub end_on_order_placed: bool,
    /// Maximum notices retained in snapshots
    pub notice_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            retry: RetryConfig::default(),
            idle_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            stability_window: Duration::from_secs(10),
            coalesce_interval: Duration::from_millis(16),
            end_on_order_placed: true,
            notice_limit: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0, 0.0), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(1, 0.0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(2, 0.0), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(4, 0.0), Duration::from_secs(8));
        assert_eq!(retry.delay_for_attempt(10, 0.0), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let retry = RetryConfig::default();
        let max = retry.delay_for_attempt(0, 0.999);
        assert!(max > Duration::from_millis(500));
        assert!(max <= Duration::from_millis(625));
        // Out-of-range samples are clamped
        assert_eq!(retry.delay_for_attempt(0, 7.0), Duration::from_millis(625));
    }

    #[test]
    fn test_backoff_non_decreasing_under_any_jitter() {
        let retry = RetryConfig::default();
        let samples = [0.0, 0.1, 0.5, 0.9, 0.999];
        for attempt in 0..8 {
            for &high in &samples {
                for &low in &samples {
                    let current = retry.delay_for_attempt(attempt, high);
                    let next = retry.delay_for_attempt(attempt + 1, low);
                    assert!(
                        next >= current,
                        "attempt {}: {:?} then {:?}",
                        attempt,
                        current,
                        next
                    );
                    assert!(next <= retry.max_delay);
                }
            }
        }
    }

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.coalesce_interval, Duration::from_millis(16));
    }
}
