//! Error kinds shared across the pipeline
//!
//! Every failure the pipeline can surface has a kind tag, a human message,
//! and a one-line recommendation for the operator.

use thiserror::Error;

/// Failures surfaced by the analysis-to-application pipeline.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Empty or oversized log, unparseable workflow configuration.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// The rule engine matched nothing; there is no failure to diagnose.
    #[error("no failure detected in the log")]
    NoFailureDetected,

    /// Prompt cannot be brought under the model's token budget.
    #[error("prompt over token budget: {used} tokens against a budget of {budget}")]
    BudgetExceeded { used: usize, budget: usize },

    /// Backend kept returning responses that violate the agent schema.
    #[error("schema violations after {attempts} attempts for {agent}: {violations:?}")]
    SchemaViolation {
        agent: String,
        attempts: u32,
        violations: Vec<String>,
    },

    /// Transport-level backend failure after retries.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Patch validation reported errors on the post-image.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The dry run predicts a conflict between patches.
    #[error("apply conflict: {0}")]
    ApplyConflict(String),

    /// The applicator failed; all snapshots were restored.
    #[error("apply failed after restoration: {0}")]
    ApplyFailed(String),

    /// Another apply or rollback holds the per-root lock.
    #[error("another application is in progress for this working tree")]
    ConcurrentApplication,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A per-call or pipeline-wide deadline elapsed.
    #[error("operation timed out after {0} ms")]
    TimedOut(u64),
}

impl ForgeError {
    /// One-line operator recommendation for each failure kind.
    pub fn recommendation(&self) -> &'static str {
        match self {
            ForgeError::InputInvalid(_) => {
                "Check that the log file is non-empty and the workflow file parses."
            }
            ForgeError::NoFailureDetected => {
                "The log contains no recognised failure pattern; inspect it manually."
            }
            ForgeError::BudgetExceeded { .. } => {
                "Reduce the log window or raise FORGE_TOKEN_BUDGET."
            }
            ForgeError::SchemaViolation { .. } => {
                "The model kept emitting malformed output; try again or switch model tier."
            }
            ForgeError::BackendUnavailable(_) => {
                "Check network access and the OPENROUTER_API_KEY environment variable."
            }
            ForgeError::ValidationFailed(_) => {
                "The generated patch does not pass syntax checks; review it manually."
            }
            ForgeError::ApplyConflict(_) => {
                "Two patches touch the same target; apply them one at a time."
            }
            ForgeError::ApplyFailed(_) => {
                "The working tree was restored from backups; inspect the audit log."
            }
            ForgeError::ConcurrentApplication => {
                "Wait for the other forgefix process to finish, then retry."
            }
            ForgeError::Cancelled => "The run was cancelled; partial results were discarded.",
            ForgeError::TimedOut(_) => "Raise the timeout or check backend latency.",
        }
    }

    /// Stable kind tag used in audit entries and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeError::InputInvalid(_) => "input_invalid",
            ForgeError::NoFailureDetected => "no_failure_detected",
            ForgeError::BudgetExceeded { .. } => "budget_exceeded",
            ForgeError::SchemaViolation { .. } => "schema_violation",
            ForgeError::BackendUnavailable(_) => "backend_unavailable",
            ForgeError::ValidationFailed(_) => "validation_failed",
            ForgeError::ApplyConflict(_) => "apply_conflict",
            ForgeError::ApplyFailed(_) => "apply_failed",
            ForgeError::ConcurrentApplication => "concurrent_application",
            ForgeError::Cancelled => "cancelled",
            ForgeError::TimedOut(_) => "timed_out",
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_recommendation() {
        let errors = vec![
            ForgeError::InputInvalid("x".into()),
            ForgeError::NoFailureDetected,
            ForgeError::BudgetExceeded { used: 10, budget: 5 },
            ForgeError::SchemaViolation {
                agent: "log_analyst".into(),
                attempts: 3,
                violations: vec!["severity: missing".into()],
            },
            ForgeError::BackendUnavailable("503".into()),
            ForgeError::ValidationFailed("tabs".into()),
            ForgeError::ApplyConflict("a.yml".into()),
            ForgeError::ApplyFailed("io".into()),
            ForgeError::ConcurrentApplication,
            ForgeError::Cancelled,
            ForgeError::TimedOut(30_000),
        ];
        for err in errors {
            assert!(!err.recommendation().is_empty());
            assert!(!err.kind().is_empty());
        }
    }

    #[test]
    fn test_kind_tags_are_snake_case() {
        assert_eq!(ForgeError::NoFailureDetected.kind(), "no_failure_detected");
        assert_eq!(ForgeError::Cancelled.kind(), "cancelled");
    }
}
