//! Retry/backoff policy for queue jobs.
//!
//! Pure functions only: the stores call [`RetryPolicy::decide`] inside their
//! own atomic section so the decision and the write can never diverge.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^retry_count
    #[default]
    Exponential,
    /// Linear backoff: base * (retry_count + 1)
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// `max_retries` stamped on jobs enqueued without an explicit limit
    pub default_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
            default_max_retries: 3,
        }
    }
}

/// What to do with a job that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to pending, eligible again after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Terminal failure (dead-letter).
    DeadLetter { retry_count: u32 },
}

impl RetryPolicy {
    /// Create a policy that dead-letters on the first failure.
    pub fn no_retry() -> Self {
        Self {
            default_max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            default_max_retries: max_retries,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            default_max_retries: max_retries,
        }
    }

    /// Delay inserted before a job that has already been retried
    /// `retry_count` times becomes eligible again.
    ///
    /// With the default policy: 2s, 4s, 8s, ... capped at one hour.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => Some(self.base_delay),
            BackoffStrategy::Exponential => 2_u32
                .checked_pow(retry_count)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
            BackoffStrategy::Linear => self
                .base_delay
                .checked_mul(retry_count.saturating_add(1)),
        };

        delay.unwrap_or(self.max_delay).min(self.max_delay)
    }

    /// Decide between retry and dead-letter for a failing job.
    ///
    /// Every retryable failure consumes one retry; the failure that brings
    /// `retry_count` up to `max_retries` dead-letters the job. A non-retryable
    /// failure dead-letters immediately and leaves the count untouched.
    pub fn decide(&self, retry_count: u32, max_retries: u32, retry_requested: bool) -> RetryDecision {
        if !retry_requested {
            return RetryDecision::DeadLetter { retry_count };
        }

        let next = retry_count.saturating_add(1);
        if next < max_retries {
            RetryDecision::Retry {
                retry_count: next,
                delay: self.backoff(retry_count),
            }
        } else {
            RetryDecision::DeadLetter {
                retry_count: next.min(max_retries),
            }
        }
    }
}
