//! Publish retry with exponential backoff.

use std::time::Duration;

use mailpipe_common::{AppResult, BrokerConfig};
use tracing::warn;

use crate::bus::MessageBus;
use crate::envelope::Envelope;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Publish retry settings from the broker section.
    #[must_use]
    pub fn from_broker(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.publish_max_attempts.max(1),
            initial_delay: Duration::from_millis(config.publish_initial_delay_ms),
            max_delay: Duration::from_millis(config.publish_max_delay_ms),
            multiplier: 2.0,
        }
    }

    /// Calculate delay after the given failed attempt (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }

    /// Check if we should try again after `attempts` failed attempts.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Publish `envelope`, retrying transient failures with backoff.
///
/// Returns the last error once the attempts are used up. Non-transient
/// errors are returned immediately.
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    envelope: &Envelope,
    config: &RetryConfig,
) -> AppResult<()> {
    let mut attempt = 0;
    loop {
        match bus.publish(envelope).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if !e.is_transient() || !config.should_retry(attempt) {
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    topic = %envelope.topic,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
