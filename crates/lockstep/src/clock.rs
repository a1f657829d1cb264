//! Fixed-step clock for lockstep consumers.
//!
//! Frame deltas are scaled by the speed factor and accumulated into a time
//! budget; the consumer takes one `step` at a time out of that budget. Budget
//! that is not consumed in a frame (because the per-frame clamp was hit or
//! the next turn has not arrived) is carried over to the next frame.
//!
//! A clock can be restarted with a signed offset: a positive offset is budget
//! the consumer has to catch up on immediately, a negative one is a delay
//! that must elapse before the first step.

use std::time::Duration;

use crate::config::ConfigError;

#[derive(Debug, Clone)]
pub struct LockstepClock {
    step: Duration,
    speed_factor: f64,
    /// 0 means unlimited.
    max_steps_per_frame: u32,
    budget: Duration,
    /// Start delay still to be paid before any step may run.
    delay: Duration,
    frame_steps: u32,
    total_steps: u64,
}

impl LockstepClock {
    pub fn new(
        step: Duration,
        speed_factor: f64,
        max_steps_per_frame: u32,
    ) -> Result<Self, ConfigError> {
        if step.is_zero() {
            return Err(ConfigError::Zero { name: "step" });
        }
        validate_speed_factor(speed_factor)?;
        Ok(Self {
            step,
            speed_factor,
            max_steps_per_frame,
            budget: Duration::ZERO,
            delay: Duration::ZERO,
            frame_steps: 0,
            total_steps: 0,
        })
    }

    /// Clear all accumulated time and start again `offset_ms` from the first
    /// step (negative = wait that long, positive = already that far in).
    pub fn restart(&mut self, offset_ms: i64) {
        let offset = Duration::from_millis(offset_ms.unsigned_abs());
        if offset_ms >= 0 {
            self.budget = offset;
            self.delay = Duration::ZERO;
        } else {
            self.budget = Duration::ZERO;
            self.delay = offset;
        }
        self.frame_steps = 0;
        self.total_steps = 0;
    }

    /// Begin a new frame, adding `dt * speed_factor` of budget.
    pub fn advance(&mut self, dt: Duration) {
        self.frame_steps = 0;
        let scaled = if self.speed_factor == 1.0 {
            dt
        } else {
            dt.mul_f64(self.speed_factor)
        };
        if self.delay >= scaled {
            self.delay -= scaled;
        } else {
            self.budget += scaled - self.delay;
            self.delay = Duration::ZERO;
        }
    }

    /// True if a whole step is available and the per-frame clamp allows it.
    pub fn can_step(&self) -> bool {
        self.delay.is_zero()
            && self.budget >= self.step
            && (self.max_steps_per_frame == 0 || self.frame_steps < self.max_steps_per_frame)
    }

    /// Consume one step of budget. Only call after `can_step` returned true.
    pub fn commit_step(&mut self) {
        self.budget = self.budget.saturating_sub(self.step);
        self.frame_steps += 1;
        self.total_steps += 1;
    }

    /// True if the per-frame clamp stopped the frame with whole steps still
    /// owed: the consumer is catching up.
    pub fn is_recovering(&self) -> bool {
        self.max_steps_per_frame != 0
            && self.frame_steps >= self.max_steps_per_frame
            && self.budget >= self.step
    }

    /// True while a start delay is still pending.
    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Whole steps currently owed, ignoring the per-frame clamp.
    pub fn pending_steps(&self) -> u64 {
        let owed = self.budget.as_nanos() / self.step.as_nanos();
        u64::try_from(owed).unwrap_or(u64::MAX)
    }

    pub fn set_speed_factor(&mut self, speed_factor: f64) -> Result<(), ConfigError> {
        validate_speed_factor(speed_factor)?;
        self.speed_factor = speed_factor;
        Ok(())
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed_factor
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Start delay still to be paid.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn steps_this_frame(&self) -> u32 {
        self.frame_steps
    }

    /// Steps committed since the last restart.
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }
}

pub(crate) fn validate_speed_factor(speed_factor: f64) -> Result<(), ConfigError> {
    if !speed_factor.is_finite() || speed_factor <= 0.0 {
        return Err(ConfigError::Invalid {
            name: "speed_factor",
            reason: format!("{speed_factor} is not a positive finite number"),
        });
    }
    Ok(())
}
