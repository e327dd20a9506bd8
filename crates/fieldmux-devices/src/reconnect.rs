/*!
 * Reconnect policy and the backoff loop adapters run after losing their
 * transport.
 */
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use fieldmux_core::types::ConnectionState;

use crate::adapter::{DeviceError, Result};
use crate::config::ReconnectConfig;
use crate::state::StatusTracker;

/// Exponential backoff bounded by a maximum delay and attempt count
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Whether reconnecting is attempted at all
    pub enabled: bool,
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Factor applied after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Every delay the policy allows, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let attempts = if self.enabled { self.max_attempts } else { 0 };
        (0..attempts).map(move |n| self.delay_for(n))
    }
}

/// Retry `attempt` under `policy`, driving `tracker` through the states
///
/// Moves to `reconnecting`, then sleeps each delay before calling
/// `attempt` with the one-based attempt number. The first success moves to
/// `connected`. Running out of attempts, or a disabled policy, moves to
/// `error` and returns the last failure.
pub async fn run_reconnect<F, Fut>(
    tracker: &StatusTracker,
    policy: &ReconnectPolicy,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let device_id = tracker.device_id().to_string();

    if !policy.enabled || policy.max_attempts == 0 {
        let msg = "reconnect disabled".to_string();
        tracker.transition(ConnectionState::Error, Some(msg.clone()));
        return Err(DeviceError::Connection(msg));
    }

    tracker.transition(ConnectionState::Reconnecting, None);

    let mut last_error = String::new();
    for (n, delay) in policy.delays().enumerate() {
        let number = n as u32 + 1;
        tokio::time::sleep(delay).await;

        match attempt(number).await {
            Ok(()) => {
                info!(device_id = %device_id, "Reconnected after {} attempts", number);
                tracker.transition(ConnectionState::Connected, None);
                return Ok(());
            }
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    "Reconnect attempt {}/{} failed: {}", number, policy.max_attempts, e
                );
                tracker.record_error(e.to_string());
                last_error = e.to_string();
            }
        }
    }

    let msg = format!(
        "gave up after {} reconnect attempts: {}",
        policy.max_attempts, last_error
    );
    tracker.transition(ConnectionState::Error, Some(msg.clone()));
    Err(DeviceError::Connection(msg))
}
