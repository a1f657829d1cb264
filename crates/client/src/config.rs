//! Client configuration.

use serde::{Deserialize, Serialize};
use turnsync_lockstep::{ConfigError, LockstepConfig};
use uuid::Uuid;

/// How far behind the authoritative turn the client simulates when the
/// server does not send a start offset.
pub const LOCAL_SIMULATION_DELAY_MS: u64 = 1000;

/// Turns retained on the client.
pub const TURN_BUFFER_CAPACITY: usize = 1024;

/// Samples kept for the buffered-turns history.
pub const DIAGNOSTICS_HISTORY_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Must match the server's config exactly.
    pub lockstep: LockstepConfig,
    pub local_simulation_delay_ms: u64,
    pub speed_factor: f64,
    /// 0 means unlimited.
    pub max_simulation_steps_per_frame: u32,
    pub turn_buffer_capacity: usize,
    /// Identifies the player across reconnects.
    pub player_token: String,
    pub diagnostics_history_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lockstep: LockstepConfig::default(),
            local_simulation_delay_ms: LOCAL_SIMULATION_DELAY_MS,
            speed_factor: 1.0,
            max_simulation_steps_per_frame: 0,
            turn_buffer_capacity: TURN_BUFFER_CAPACITY,
            player_token: Uuid::new_v4().to_string(),
            diagnostics_history_size: DIAGNOSTICS_HISTORY_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.speed_factor.is_finite() || self.speed_factor <= 0.0 {
            return Err(ConfigError::Invalid {
                name: "speed_factor",
                reason: format!("{} is not a positive finite number", self.speed_factor),
            });
        }
        if self.turn_buffer_capacity == 0 {
            return Err(ConfigError::Zero {
                name: "turn_buffer_capacity",
            });
        }
        if self.diagnostics_history_size == 0 {
            return Err(ConfigError::Zero {
                name: "diagnostics_history_size",
            });
        }
        if self.player_token.is_empty() {
            return Err(ConfigError::Invalid {
                name: "player_token",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid_with_random_token() {
        let a = ClientConfig::default();
        let b = ClientConfig::default();
        assert!(a.validate().is_ok());
        assert_ne!(a.player_token, b.player_token);
        assert!(Uuid::parse_str(&a.player_token).is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"speed_factor": 2.0, "player_token": "p1"}"#).unwrap();
        assert_eq!(config.speed_factor, 2.0);
        assert_eq!(config.player_token, "p1");
        assert_eq!(config.local_simulation_delay_ms, LOCAL_SIMULATION_DELAY_MS);
        assert_eq!(config.lockstep, LockstepConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = ClientConfig {
            speed_factor: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            player_token: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            turn_buffer_capacity: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                name: "turn_buffer_capacity"
            })
        );
    }
}
