//! Retry policies and backoff delay computation.
//!
//! Delay computation is pure and deterministic given its inputs, so the
//! strategies are testable in isolation from the worker.

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Backoff strategy applied before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// delay = base_delay
    Fixed,
    /// delay = attempts_made * base_delay
    Linear,
    /// delay = base_delay * multiplier^(attempts_made - 1)
    Exponential,
}

/// Retry ceiling and backoff parameters, persisted with each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Exponential growth factor; defaults to 2.0 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            base_delay_ms,
            max_delay_ms: None,
            multiplier: None,
        }
    }

    pub fn linear(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear,
            base_delay_ms,
            max_delay_ms: None,
            multiplier: None,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential,
            base_delay_ms,
            max_delay_ms: None,
            multiplier: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Reject nonsensical parameters before a job is persisted with them.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_attempts == 0 {
            return Err(QueueError::Validation(
                "retry policy requires max_attempts >= 1".to_string(),
            ));
        }
        if let Some(m) = self.multiplier {
            if !m.is_finite() || m < 1.0 {
                return Err(QueueError::Validation(format!(
                    "retry multiplier must be finite and >= 1.0, got {m}"
                )));
            }
        }
        Ok(())
    }

    /// True iff another attempt is allowed after `attempts_made` attempts.
    #[inline]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Wait time in milliseconds before the next attempt becomes eligible.
    ///
    /// Called only when a retry is warranted; `attempts_made == 0` yields 0.
    pub fn calculate_delay(&self, attempts_made: u32) -> u64 {
        if attempts_made == 0 {
            return 0;
        }

        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Linear => (attempts_made as u64).saturating_mul(self.base_delay_ms),
            Backoff::Exponential => {
                let multiplier = self.multiplier.unwrap_or(DEFAULT_MULTIPLIER);
                let factor = multiplier.powi((attempts_made - 1) as i32);
                let raw = self.base_delay_ms as f64 * factor;
                if raw >= u64::MAX as f64 {
                    u64::MAX
                } else {
                    raw.round() as u64
                }
            }
        };

        match self.max_delay_ms {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts with 1s exponential backoff (1s, 2s, 4s...).
    fn default() -> Self {
        Self::exponential(3, 1000)
    }
}
