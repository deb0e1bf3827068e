//! Workflow-driven activity retries. Retry decisions happen inside the
//! deterministic scheduler: backoff delays are workflow timers and jitter
//! factors are recorded side effects, so replays retrace the same attempts.

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Per-schedule retry policy for activities.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    /// Randomization factor in `[0, 1]`: each delay is scaled by a factor
    /// drawn from `1 ± jitter/2`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (1-based attempt that failed),
    /// without jitter.
    fn delay_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_interval.as_millis() as f64;
        let factor = self.backoff_coefficient.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let capped = (base * factor).min(self.max_interval.as_millis() as f64);
        capped as u64
    }
}

impl WorkflowContext {
    /// Schedule an activity, retrying failed attempts per `policy`. Only
    /// retryable failures retry; cancellation always surfaces immediately.
    pub async fn schedule_activity_with_retry<I, O>(
        &self,
        name: impl Into<String>,
        input: &I,
        policy: RetryPolicy,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let name = name.into();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.schedule_activity::<I, O>(&name, input).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.retryable || err.is_canceled() || attempt >= max_attempts {
                return Err(err);
            }
            let mut delay_ms = policy.delay_ms(attempt);
            if policy.jitter > 0.0 && delay_ms > 0 {
                let drawn: f64 = self.side_effect(|| rand::random::<f64>())?;
                let scale = 1.0 + policy.jitter * (drawn - 0.5);
                delay_ms = ((delay_ms as f64) * scale).max(0.0) as u64;
            }
            if delay_ms > 0 && self.timer(Duration::from_millis(delay_ms)).await.is_err() {
                return Err(WorkflowError::canceled());
            }
        }
    }
}
