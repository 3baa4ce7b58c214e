//! Retry policy with fixed or exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// How the delay grows between attempts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackoffStrategy {
    /// Always wait `initial`.
    Fixed,
    /// Double the delay after every failure, capped at `max`.
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a request makes at most `retries + 1` attempts.
    pub retries: u32,
    /// Delay growth.
    pub strategy: BackoffStrategy,
    /// Delay after the first failure.
    pub initial: Duration,
    /// Delay cap, also applied to server supplied `Retry-After` hints.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            strategy: BackoffStrategy::Exponential,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed for one logical request.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// A server hint takes precedence over the computed delay.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max);
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.initial.min(self.max),
            BackoffStrategy::Exponential => {
                let pow = attempt.saturating_sub(1).min(30);
                self.initial
                    .checked_mul(1u32 << pow)
                    .unwrap_or(self.max)
                    .min(self.max)
            }
        }
    }
}
