//! Restart policy and backoff calculation.
//!
//! The default policy replaces an exited worker at once, every time. The
//! backoff policy delays replacements for workers that die shortly after
//! starting, doubling the delay for each consecutive short-lived worker.
//! Neither policy ever stops replacing workers.

use std::time::Duration;
use tracing::debug;

/// How exited workers are replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Respawn with no delay.
    #[default]
    Immediate,
    /// Exponential delay for crash loops.
    Backoff {
        /// Delay after the first short-lived worker.
        initial: Duration,
        /// Upper bound on the delay.
        max: Duration,
        /// Workers that lived at least this long reset the streak.
        stable_after: Duration,
    },
}

/// Tracks consecutive short-lived workers and computes respawn delays.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    streak: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy, streak: 0 }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Consecutive exits that counted as crashes.
    #[cfg(test)]
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Delay before replacing a worker that ran for `uptime`.
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        match self.policy {
            RestartPolicy::Immediate => Duration::ZERO,
            RestartPolicy::Backoff {
                initial,
                max,
                stable_after,
            } => {
                if uptime >= stable_after {
                    if self.streak > 0 {
                        debug!(streak = self.streak, "Worker was stable, resetting backoff");
                    }
                    self.streak = 0;
                    return Duration::ZERO;
                }

                let factor = 1u32 << self.streak.min(16);
                let delay = initial.saturating_mul(factor).min(max);
                self.streak = self.streak.saturating_add(1);
                debug!(
                    streak = self.streak,
                    delay_ms = delay.as_millis() as u64,
                    "Worker exited early, backing off"
                );
                delay
            }
        }
    }
}
