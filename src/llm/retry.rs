//! Retry orchestration for backend calls
//!
//! Wraps one expert call with bounded attempts, exponential backoff, a
//! per-attempt timeout, and schema-driven re-prompting. On a schema
//! failure the next attempt receives the violation list so the caller can
//! inject a correction directive; on a transport failure the call is simply
//! retried. Cancellation is not counted as an attempt.

use crate::error::ForgeError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a single attempt failed.
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// Transport-level failure; retry without changing the prompt.
    Transport(String),
    /// The response violated the agent schema; re-prompt with corrections.
    Schema(Vec<String>),
}

/// Bounded-retry policy with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Tighter per-attempt timeout used for agent runs inside the pipeline.
    pub fn pipeline() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            ..Self::default()
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.saturating_sub(1));
        (self.initial_backoff * factor).min(self.max_backoff)
    }
}

/// Successful outcome plus how many retries it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub retries_used: u32,
}

/// Drive `attempt` to success within the policy's bounds.
///
/// `attempt` receives the 1-based attempt number and, after a schema
/// failure, the violations from the previous attempt.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<RetryOutcome<T>, ForgeError>
where
    F: FnMut(u32, Option<Vec<String>>) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut prior_violations: Option<Vec<String>> = None;
    let mut last_error: Option<AttemptError> = None;
    let mut timed_out = false;

    for attempt_no in 1..=policy.max_attempts {
        if attempt_no > 1 {
            let backoff = policy.backoff_for(attempt_no - 1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let fut = attempt(attempt_no, prior_violations.take());
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            result = tokio::time::timeout(policy.attempt_timeout, fut) => result,
        };

        match result {
            Ok(Ok(value)) => {
                return Ok(RetryOutcome {
                    value,
                    retries_used: attempt_no - 1,
                });
            }
            Ok(Err(AttemptError::Schema(violations))) => {
                tracing::debug!(
                    agent = label,
                    attempt = attempt_no,
                    ?violations,
                    "schema violations, re-prompting"
                );
                prior_violations = Some(violations.clone());
                last_error = Some(AttemptError::Schema(violations));
            }
            Ok(Err(AttemptError::Transport(message))) => {
                tracing::debug!(agent = label, attempt = attempt_no, %message, "transport failure");
                last_error = Some(AttemptError::Transport(message));
            }
            Err(_elapsed) => {
                tracing::debug!(agent = label, attempt = attempt_no, "attempt timed out");
                timed_out = true;
                last_error = None;
            }
        }
    }

    match last_error {
        Some(AttemptError::Schema(violations)) => Err(ForgeError::SchemaViolation {
            agent: label.to_string(),
            attempts: policy.max_attempts,
            violations,
        }),
        Some(AttemptError::Transport(message)) => Err(ForgeError::BackendUnavailable(message)),
        None if timed_out => Err(ForgeError::TimedOut(policy.attempt_timeout.as_millis() as u64)),
        None => Err(ForgeError::BackendUnavailable("no attempts were made".to_string())),
    }
}

/// Correction directive injected after a schema failure.
pub fn correction_directive(violations: &[String]) -> String {
    let mut directive = String::from(
        "Your previous response violated the required schema.\nViolations:\n",
    );
    for violation in violations {
        directive.push_str("- ");
        directive.push_str(violation);
        directive.push('\n');
    }
    directive.push_str(
        "Respond again with pure JSON only: no markdown fences, no commentary, every required field present.",
    );
    directive
}
