//! Retry policy for channel hand-offs
//!
//! Provides exponential backoff and the retry decision for [`BridgeError`]s.
//! Retries always reuse the original message id, so the peer gateway sees a
//! redelivery at worst.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BridgeError, ErrorCategory, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Channel or storage hiccup, retry with backoff
    Transient,
    /// Request is invalid or unfunded, retrying cannot help
    Permanent,
    /// Gateway is halted, stop until reconfigured
    Fatal,
}

pub fn classify_error(error: &BridgeError) -> ErrorClass {
    if error.is_retryable() {
        return ErrorClass::Transient;
    }
    match error.category() {
        ErrorCategory::Fatal => ErrorClass::Fatal,
        _ => ErrorClass::Permanent,
    }
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    RetryAfter(Duration),
    /// Out of attempts or not retryable; surface the error
    GiveUp,
    /// Stop processing entirely
    Halt,
}

#[derive(Debug, Clone)]
pub struct RetryContext {
    pub policy: RetryPolicy,
    pub attempt: u32,
    pub last_error: Option<BridgeError>,
}

impl RetryContext {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_error: None,
        }
    }

    pub fn record_failure(&mut self, error: BridgeError) {
        self.attempt += 1;
        self.last_error = Some(error);
    }

    pub fn next_action(&self) -> RetryAction {
        let Some(error) = &self.last_error else {
            return RetryAction::RetryAfter(self.policy.backoff_for_attempt(self.attempt));
        };

        match classify_error(error) {
            ErrorClass::Fatal => {
                warn!(error = %error, "Fatal error - halting");
                RetryAction::Halt
            }
            ErrorClass::Permanent => {
                debug!(error = %error, "Permanent error - not retrying");
                RetryAction::GiveUp
            }
            ErrorClass::Transient => {
                if !self.policy.should_retry(self.attempt) {
                    return RetryAction::GiveUp;
                }
                let backoff = self.policy.backoff_for_attempt(self.attempt);
                debug!(?backoff, attempt = self.attempt, "Transient error - retrying");
                RetryAction::RetryAfter(backoff)
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_error = None;
    }
}

/// Run `operation` until it succeeds or the policy gives up
///
/// The closure receives the attempt number and must reuse the same message id
/// on every attempt.
pub async fn with_retry<F, T, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut ctx = RetryContext::new(policy.clone());

    loop {
        match operation(ctx.attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                ctx.record_failure(e.clone());
                match ctx.next_action() {
                    RetryAction::RetryAfter(backoff) => {
                        warn!(
                            attempt = ctx.attempt,
                            max = policy.max_retries,
                            ?backoff,
                            error = %e,
                            "Retrying after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    RetryAction::GiveUp | RetryAction::Halt => return Err(e),
                }
            }
        }
    }
}
