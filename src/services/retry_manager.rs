//! Retry/backoff decisions for failed step executions.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::errors::{DomainResult, StepError};
use crate::domain::models::{RetryConfig, StepInstance, StepStatus};

/// What happens to a step after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        retry_count: u32,
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    /// Give up; the step becomes `failed`.
    Fail { recoverable: bool },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry_count` (1-based). The last ladder
    /// entry repeats once the ladder is exhausted.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let ladder = &self.config.delays_ms;
        if ladder.is_empty() {
            return Duration::ZERO;
        }
        let idx = (retry_count.saturating_sub(1) as usize).min(ladder.len() - 1);
        Duration::from_millis(ladder[idx])
    }

    /// Recoverability under the configured policy.
    pub fn is_recoverable(&self, error: &StepError) -> bool {
        match error {
            StepError::RateLimit { .. } => self.config.retry_rate_limited,
            other => other.is_recoverable(),
        }
    }

    /// Decide without mutating the step.
    pub fn decide(&self, step: &StepInstance, error: &StepError, now: DateTime<Utc>) -> RetryDecision {
        let recoverable = self.is_recoverable(error);
        if !recoverable || step.retry_count >= step.max_retries {
            return RetryDecision::Fail { recoverable };
        }

        let retry_count = step.retry_count + 1;
        let delay = self.delay_for(retry_count);
        let retry_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        RetryDecision::Retry {
            retry_count,
            delay,
            retry_at,
        }
    }

    /// Record the error on an in-progress step and move it to
    /// `retry_pending` or `failed`.
    pub fn apply(&self, step: &mut StepInstance, error: &StepError) -> DomainResult<RetryDecision> {
        let decision = self.decide(step, error, Utc::now());
        step.record_error(error.to_string(), error.class());

        match &decision {
            RetryDecision::Retry {
                retry_count, retry_at, delay,
            } => {
                step.transition_to(StepStatus::RetryPending)?;
                step.retry_count = *retry_count;
                step.retry_at = Some(*retry_at);
                tracing::info!(
                    run_id = %step.run_id,
                    step_id = %step.id,
                    sequence = step.sequence,
                    retry_count,
                    max_retries = step.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error_class = error.class().as_str(),
                    "step scheduled for retry"
                );
            }
            RetryDecision::Fail { recoverable } => {
                step.transition_to(StepStatus::Failed)?;
                tracing::warn!(
                    run_id = %step.run_id,
                    step_id = %step.id,
                    sequence = step.sequence,
                    retry_count = step.retry_count,
                    recoverable,
                    error_class = error.class().as_str(),
                    error = %error,
                    "step failed permanently"
                );
            }
        }
        Ok(decision)
    }
}
