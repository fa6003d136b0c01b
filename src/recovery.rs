// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Recovery Policy
//!
//! When a dispatch loop faults, the dispatcher tears down every consumer,
//! waits for a cooldown and installs the whole consumer table again. The
//! [`RecoveryPolicy`] decides how long to wait before each restart and when
//! to stop trying.

use std::time::Duration;

/// Cooldown applied before restarting the consumers.
pub const DEFAULT_RECOVERY_COOLDOWN: Duration = Duration::from_secs(5);

/// Outcome of asking the policy what to do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Restart after waiting `delay`; `attempt` is 1-based.
    Retrying { attempt: u32, delay: Duration },
    /// Stop restarting; the listener returns an error.
    GivingUp { attempts: u32 },
}

/// Backoff with a ceiling and an optional bound on consecutive restarts.
///
/// The delay before attempt `n` is `cooldown * multiplier^(n - 1)`, capped at
/// `max_cooldown`. The default is a fixed 5 second cooldown with no bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub multiplier: u32,
    pub max_attempts: Option<u32>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy::fixed(DEFAULT_RECOVERY_COOLDOWN)
    }
}

impl RecoveryPolicy {
    /// Same cooldown before every restart, never gives up.
    pub fn fixed(cooldown: Duration) -> RecoveryPolicy {
        RecoveryPolicy {
            cooldown,
            max_cooldown: cooldown,
            multiplier: 1,
            max_attempts: None,
        }
    }

    /// Gives up after `max_attempts` consecutive restarts.
    pub fn bounded(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Grows the cooldown by `multiplier` per attempt up to `max_cooldown`.
    pub fn with_backoff(mut self, multiplier: u32, max_cooldown: Duration) -> Self {
        self.multiplier = multiplier.max(1);
        self.max_cooldown = max_cooldown.max(self.cooldown);
        self
    }

    /// Decides what happens on the `attempt`-th consecutive fault.
    ///
    /// # Parameters
    /// * `attempt` - Consecutive faults so far, starting at 1
    ///
    /// # Returns
    /// `RecoveryState::Retrying` with the cooldown to wait, or
    /// `RecoveryState::GivingUp` once `max_attempts` is exceeded
    pub fn next(&self, attempt: u32) -> RecoveryState {
        let attempt = attempt.max(1);

        if let Some(max) = self.max_attempts {
            if attempt > max {
                return RecoveryState::GivingUp { attempts: max };
            }
        }

        let factor = self.multiplier.saturating_pow(attempt - 1);
        let delay = self
            .cooldown
            .checked_mul(factor)
            .unwrap_or(self.max_cooldown)
            .min(self.max_cooldown);

        RecoveryState::Retrying { attempt, delay }
    }
}
