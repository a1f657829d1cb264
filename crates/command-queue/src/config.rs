//! Command queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use turnsync_lockstep::ConfigError;

pub const SEND_INTERVAL_MS: u64 = 20_000;
pub const TIMEOUT_MS: u64 = 60_000;
pub const BACKOFF_MULTIPLIER: f64 = 1.1;
pub const MAX_BACKOFF_MS: u64 = 5 * 60 * 1000;
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Time between regular sends.
    pub send_interval_ms: u64,
    /// Request timeout, and the base of the retry backoff.
    pub timeout_ms: u64,
    pub backoff_multiplier: f64,
    /// Cap for both the backoff delay and the grown timeout.
    pub max_backoff_ms: u64,
    /// Failed sends a command survives before it fails with
    /// `RetriesExhausted`.
    pub max_retries: u32,
    /// Report `OutOfSync` after this long without a successful send.
    /// 0 disables the report.
    pub max_out_of_sync_interval_ms: u64,
    /// Send an empty packet on the interval when nothing is pending.
    pub ping_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: SEND_INTERVAL_MS,
            timeout_ms: TIMEOUT_MS,
            backoff_multiplier: BACKOFF_MULTIPLIER,
            max_backoff_ms: MAX_BACKOFF_MS,
            max_retries: MAX_RETRIES,
            max_out_of_sync_interval_ms: 0,
            ping_enabled: true,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_interval_ms == 0 {
            return Err(ConfigError::Zero {
                name: "send_interval_ms",
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero { name: "timeout_ms" });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                name: "backoff_multiplier",
                reason: format!("{} must be a finite number >= 1", self.backoff_multiplier),
            });
        }
        if self.max_backoff_ms < self.timeout_ms {
            return Err(ConfigError::Invalid {
                name: "max_backoff_ms",
                reason: format!(
                    "{} is below the timeout of {}ms",
                    self.max_backoff_ms, self.timeout_ms
                ),
            });
        }
        Ok(())
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_out_of_sync_interval(&self) -> Option<Duration> {
        (self.max_out_of_sync_interval_ms > 0)
            .then(|| Duration::from_millis(self.max_out_of_sync_interval_ms))
    }

    /// `timeout * backoff_multiplier^attempt`, capped by `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.timeout_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !millis.is_finite() || millis >= self.max_backoff_ms as f64 {
            return self.max_backoff();
        }
        Duration::from_millis(millis.round() as u64)
    }
}
