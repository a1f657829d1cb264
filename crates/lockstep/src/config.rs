//! Negotiated lockstep timing.
//!
//! A [`LockstepConfig`] is fixed for a whole session. The server sends it to
//! every client on connect and a client refuses to play with a server whose
//! config differs from its own.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Defaults
// ============================================================================

/// Default turn length in milliseconds (10 turns per second).
pub const DEFAULT_COMMAND_STEP_MS: u32 = 100;

/// Default simulation step length in milliseconds.
pub const DEFAULT_SIMULATION_STEP_MS: u32 = 100;

// ============================================================================
// Errors
// ============================================================================

/// Configuration fault. Raised at construction or connect time, never
/// tolerated mid-session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error(
        "command step {command_step_ms}ms is not a multiple of simulation step {simulation_step_ms}ms"
    )]
    StepNotMultiple {
        command_step_ms: u32,
        simulation_step_ms: u32,
    },
    #[error("lockstep config mismatch: local {local:?}, remote {remote:?}")]
    Mismatch {
        local: LockstepConfig,
        remote: LockstepConfig,
    },
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

// ============================================================================
// LockstepConfig
// ============================================================================

/// Turn and simulation step durations.
///
/// Fields are private so a validated config cannot be altered after it has
/// been negotiated. Deserialization goes through the same validation as
/// [`LockstepConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawLockstepConfig", into = "RawLockstepConfig")]
pub struct LockstepConfig {
    command_step_ms: u32,
    simulation_step_ms: u32,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            command_step_ms: DEFAULT_COMMAND_STEP_MS,
            simulation_step_ms: DEFAULT_SIMULATION_STEP_MS,
        }
    }
}

impl LockstepConfig {
    /// Build a config. The command step must be a positive multiple of the
    /// simulation step.
    pub fn new(command_step_ms: u32, simulation_step_ms: u32) -> Result<Self, ConfigError> {
        if command_step_ms == 0 {
            return Err(ConfigError::Zero {
                name: "command_step_ms",
            });
        }
        if simulation_step_ms == 0 {
            return Err(ConfigError::Zero {
                name: "simulation_step_ms",
            });
        }
        if command_step_ms % simulation_step_ms != 0 {
            return Err(ConfigError::StepNotMultiple {
                command_step_ms,
                simulation_step_ms,
            });
        }
        Ok(Self {
            command_step_ms,
            simulation_step_ms,
        })
    }

    pub fn command_step_ms(&self) -> u32 {
        self.command_step_ms
    }

    pub fn simulation_step_ms(&self) -> u32 {
        self.simulation_step_ms
    }

    pub fn command_step(&self) -> Duration {
        Duration::from_millis(u64::from(self.command_step_ms))
    }

    pub fn simulation_step(&self) -> Duration {
        Duration::from_millis(u64::from(self.simulation_step_ms))
    }

    /// Number of simulation steps per turn.
    pub fn steps_per_turn(&self) -> u32 {
        self.command_step_ms / self.simulation_step_ms
    }

    /// Fail with `Mismatch` unless `remote` is identical to `self`.
    pub fn ensure_matches(&self, remote: &LockstepConfig) -> Result<(), ConfigError> {
        if self == remote {
            Ok(())
        } else {
            Err(ConfigError::Mismatch {
                local: *self,
                remote: *remote,
            })
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
struct RawLockstepConfig {
    command_step_ms: u32,
    simulation_step_ms: u32,
}

impl Default for RawLockstepConfig {
    fn default() -> Self {
        LockstepConfig::default().into()
    }
}

impl From<LockstepConfig> for RawLockstepConfig {
    fn from(config: LockstepConfig) -> Self {
        Self {
            command_step_ms: config.command_step_ms,
            simulation_step_ms: config.simulation_step_ms,
        }
    }
}

impl TryFrom<RawLockstepConfig> for LockstepConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLockstepConfig) -> Result<Self, Self::Error> {
        Self::new(raw.command_step_ms, raw.simulation_step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LockstepConfig::default();
        assert_eq!(config.command_step(), Duration::from_millis(100));
        assert_eq!(config.simulation_step(), Duration::from_millis(100));
        assert_eq!(config.steps_per_turn(), 1);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            LockstepConfig::new(0, 10),
            Err(ConfigError::Zero {
                name: "command_step_ms"
            })
        );
        assert_eq!(
            LockstepConfig::new(10, 0),
            Err(ConfigError::Zero {
                name: "simulation_step_ms"
            })
        );
        assert_eq!(
            LockstepConfig::new(100, 30),
            Err(ConfigError::StepNotMultiple {
                command_step_ms: 100,
                simulation_step_ms: 30
            })
        );
        assert_eq!(LockstepConfig::new(100, 25).unwrap().steps_per_turn(), 4);
    }

    #[test]
    fn test_mismatch_detected() {
        let local = LockstepConfig::new(100, 50).unwrap();
        let remote = LockstepConfig::new(200, 50).unwrap();
        assert!(local.ensure_matches(&local).is_ok());
        assert_eq!(
            local.ensure_matches(&remote),
            Err(ConfigError::Mismatch { local, remote })
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let config: LockstepConfig =
            serde_json::from_str(r#"{"command_step_ms": 60, "simulation_step_ms": 20}"#).unwrap();
        assert_eq!(config.steps_per_turn(), 3);

        let partial: LockstepConfig =
            serde_json::from_str(r#"{"simulation_step_ms": 50}"#).unwrap();
        assert_eq!(partial.command_step_ms(), DEFAULT_COMMAND_STEP_MS);

        let invalid = serde_json::from_str::<LockstepConfig>(
            r#"{"command_step_ms": 100, "simulation_step_ms": 30}"#,
        );
        assert!(invalid.is_err());
    }

    #[test]
    fn test_serialize_roundtrip_through_json() {
        let config = LockstepConfig::new(120, 40).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"command_step_ms":120,"simulation_step_ms":40}"#);
    }
}
