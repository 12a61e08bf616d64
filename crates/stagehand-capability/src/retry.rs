//! Classified retries with exponential backoff
//!
//! On failure the policy looks at the error's classification: fatal errors
//! (and every policy failure such as validation or egress denial) surface
//! immediately, retryable errors are attempted again up to `max_attempts`
//! times. Waits go through a [`DurableSleep`] so an orchestrator can make
//! them crash-safe; nothing here blocks a thread.
//!
//! Idempotency is not consulted. Whether a blind retry of a side effect is
//! safe is the caller's decision, made when it picks the descriptor's
//! policy.

use crate::error::{CapabilityError, CapabilityResult, DescriptorError};
use crate::invocation::ValidatedInvocation;
use crate::registry::RegisteredCapability;
use crate::runtime::ExecutionRuntime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_interval_seconds: f64,
    /// Multiplier applied per further failure
    pub backoff_coefficient: f64,
    /// Upper bound on a single wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval_seconds: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_seconds: 1.0,
            backoff_coefficient: 2.0,
            maximum_interval_seconds: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[inline]
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Create a policy
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32, initial_interval_seconds: f64, backoff_coefficient: f64) -> Self {
        Self {
            max_attempts,
            initial_interval_seconds,
            backoff_coefficient,
            maximum_interval_seconds: None,
        }
    }

    /// With a cap on single waits
    #[inline]
    #[must_use]
    pub fn with_maximum_interval(mut self, seconds: f64) -> Self {
        self.maximum_interval_seconds = Some(seconds);
        self
    }

    /// Check ranges
    ///
    /// # Errors
    /// `max_attempts == 0`, negative or non-finite intervals, coefficient below 1.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.max_attempts == 0 {
            return Err(DescriptorError::InvalidRetryPolicy(
                "maxAttempts must be at least 1".into(),
            ));
        }
        if !self.initial_interval_seconds.is_finite() || self.initial_interval_seconds < 0.0 {
            return Err(DescriptorError::InvalidRetryPolicy(
                "initialIntervalSeconds must be a non-negative number".into(),
            ));
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(DescriptorError::InvalidRetryPolicy(
                "backoffCoefficient must be at least 1".into(),
            ));
        }
        if let Some(max) = self.maximum_interval_seconds {
            if !max.is_finite() || max < 0.0 {
                return Err(DescriptorError::InvalidRetryPolicy(
                    "maximumIntervalSeconds must be a non-negative number".into(),
                ));
            }
        }
        Ok(())
    }

    /// Wait after the `attempt`-th failure (1-based):
    /// `initial * coefficient^(attempt - 1)`
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut seconds = self.initial_interval_seconds * self.backoff_coefficient.powi(exponent);
        if let Some(max) = self.maximum_interval_seconds {
            seconds = seconds.min(max);
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Suspension primitive used between attempts
#[async_trait]
pub trait DurableSleep: Send + Sync {
    /// Suspend before attempt `attempt + 1`
    ///
    /// # Errors
    /// `CANCELLED` if the wait was interrupted.
    async fn sleep(&self, attempt: u32, duration: Duration) -> Result<(), CapabilityError>;
}

/// In-process sleep, for callers without a durable substrate
#[derive(Debug, Clone, Default)]
pub struct TokioSleep {
    cancel: CancellationToken,
}

impl TokioSleep {
    /// Sleep that can be interrupted through `cancel`
    #[must_use]
    pub fn cancellable(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl DurableSleep for TokioSleep {
    async fn sleep(&self, _attempt: u32, duration: Duration) -> Result<(), CapabilityError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.cancel.cancelled() => Err(CapabilityError::cancelled("retry wait")),
        }
    }
}

/// Result of a retried invocation
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// Final result (last error when retries are exhausted)
    pub result: CapabilityResult,
    /// Attempts made
    pub attempts: u32,
}

/// Run `invocation` under the capability's retry policy
pub async fn execute_with_retry(
    runtime: &ExecutionRuntime,
    capability: &RegisteredCapability,
    invocation: &ValidatedInvocation,
    sleeper: &dyn DurableSleep,
) -> RetryOutcome {
    let policy = capability.descriptor().operations().retry_policy;
    let cap_id = capability.descriptor().id();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = runtime.execute(capability, invocation.clone()).await;

        let error = match result {
            Ok(output) => {
                return RetryOutcome {
                    result: Ok(output),
                    attempts,
                }
            }
            Err(error) => error,
        };

        if !error.retryable || error.kind.is_policy() {
            tracing::debug!(capability = cap_id, attempts, kind = %error.kind, "not retrying");
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }
        if attempts >= policy.max_attempts {
            tracing::warn!(capability = cap_id, attempts, "retry attempts exhausted");
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.delay_after(attempts);
        tracing::warn!(
            capability = cap_id,
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "retryable failure, backing off"
        );
        if let Err(cancelled) = sleeper.sleep(attempts, delay).await {
            return RetryOutcome {
                result: Err(cancelled),
                attempts,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_follow_exponential_schedule() {
        let policy = RetryPolicy::new(3, 2.0, 2.0);
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn maximum_interval_caps_delay() {
        let policy = RetryPolicy::new(10, 1.0, 10.0).with_maximum_interval(30.0);
        assert_eq!(policy.delay_after(5), Duration::from_secs(30));
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(RetryPolicy::new(0, 1.0, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, -1.0, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, 1.0, 0.5).validate().is_err());
        assert!(RetryPolicy::new(3, f64::NAN, 2.0).validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleep_is_cancellable() {
        let cancel = CancellationToken::new();
        let sleeper = TokioSleep::cancellable(cancel.clone());
        cancel.cancel();
        let err = sleeper.sleep(1, Duration::from_secs(3600)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Cancelled);
    }

    proptest! {
        #[test]
        fn prop_delays_never_decrease(
            initial in 0.0f64..10.0,
            coefficient in 1.0f64..4.0,
            attempt in 1u32..12
        ) {
            let policy = RetryPolicy::new(20, initial, coefficient);
            prop_assert!(policy.delay_after(attempt + 1) >= policy.delay_after(attempt));
        }
    }
}
