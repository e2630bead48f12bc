//! Bounded retry with jittered exponential backoff.
//!
//! Connection failures are always retried; service errors only when the
//! service marked them retry-safe. A rate-limited response widens the
//! attempt budget by one (up to a cap) and raises the delay floor.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::cancel::Cancellation;
use crate::error::ClientError;
use crate::transport::{ApiRequest, Transport};

/// Limits applied to a single logical request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before giving up, excluding rate-limit extensions.
    pub max_attempts: u32,
    /// Upper bound on budget extensions granted for rate-limited responses.
    pub max_rate_limit_extensions: u32,
    /// Delay floor after an ordinary failure.
    pub min_delay: Duration,
    /// Delay floor after a rate-limited response.
    pub rate_limited_min_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_rate_limit_extensions: 5,
            min_delay: Duration::from_secs(1),
            rate_limited_min_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that surfaces the first failure without retrying.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            max_rate_limit_extensions: 0,
            min_delay: Duration::ZERO,
            rate_limited_min_delay: Duration::ZERO,
        }
    }
}

/// Outcome of recording a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// Surface the error to the caller.
    GiveUp,
}

/// Mutable bookkeeping for one logical request.
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    max_attempts: u32,
    extensions: u32,
}

impl RetryState {
    /// Starts tracking a fresh request.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            max_attempts: policy.max_attempts,
            extensions: 0,
        }
    }

    /// Number of failures recorded so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current attempt budget, including rate-limit extensions.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records a failure and decides whether to retry. `sample` is a jitter
    /// draw from `[0, 1)`.
    pub fn record_failure(&mut self, error: &ClientError, sample: f64) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        let mut floor = self.policy.min_delay;
        if error.rate_limited().is_some() {
            if self.extensions < self.policy.max_rate_limit_extensions {
                self.extensions += 1;
                self.max_attempts = self.max_attempts.saturating_add(1);
            }
            floor = self.policy.rate_limited_min_delay;
        }

        if error.is_retryable() && self.attempt < self.max_attempts {
            RetryDecision::Retry(backoff_delay(self.attempt, sample, floor))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Returns `max(2^attempt × sample, floor)` seconds.
///
/// `sample` is clamped to `[0, 1]` and the exponent to 32.
#[must_use]
pub fn backoff_delay(attempt: u32, sample: f64, floor: Duration) -> Duration {
    let ceiling = Duration::from_secs(1_u64 << attempt.min(32));
    ceiling.mul_f64(sample.clamp(0.0, 1.0)).max(floor)
}

/// Draws a uniform jitter sample from `[0, 1)`.
#[must_use]
pub fn uniform_jitter() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}

/// Sends requests through a [`Transport`] with bounded retries.
pub struct RetryingRequester<T> {
    transport: T,
    policy: RetryPolicy,
    jitter: Arc<dyn Fn() -> f64 + Send + Sync>,
    cancellation: Cancellation,
}

impl<T: Transport> RetryingRequester<T> {
    /// Wraps `transport` with the default policy and random jitter.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            jitter: Arc::new(uniform_jitter),
            cancellation: Cancellation::never(),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the jitter source.
    #[cfg(any(test, feature = "test-backdoors"))]
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Attaches a cancellation token observed by every backoff sleep and by
    /// the waiters built on this requester.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Returns the active retry policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Returns the cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Returns the wrapped transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `request`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last failure unmodified once it is not retry-safe or the
    /// attempt budget is spent, or [`ClientError::Cancelled`] when a backoff
    /// sleep is cancelled.
    pub async fn send(&self, request: &ApiRequest) -> Result<Value, ClientError> {
        let mut state = RetryState::new(self.policy);
        loop {
            request.log_attempt(state.attempt());
            let error = match self.transport.execute(request).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match state.record_failure(&error, (self.jitter)()) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        path = request.path(),
                        attempt = state.attempt(),
                        max_attempts = state.max_attempts(),
                        delay_secs = delay.as_secs_f64(),
                        error = %error,
                        "request failed, retrying"
                    );
                    self.cancellation.pause(delay).await?;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }

    /// Sends `request` and decodes the body into `R`.
    ///
    /// # Errors
    ///
    /// Returns any error from [`RetryingRequester::send`], or
    /// [`ClientError::UnexpectedResponse`] when the body does not match `R`.
    pub async fn send_as<R: DeserializeOwned>(&self, request: &ApiRequest) -> Result<R, ClientError> {
        let value = self.send(request).await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::unexpected(request.path(), err.to_string()))
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RetryingRequester<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingRequester")
            .field("transport", &self.transport)
            .field("policy", &self.policy)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
