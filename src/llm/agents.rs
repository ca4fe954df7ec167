//! One expert role, end to end
//!
//! An agent run is one role through the full call discipline: budget check,
//! backend call, tolerant parse, schema validation, and bounded retry with
//! correction directives.

use super::budget::TokenBudget;
use super::client::ChatBackend;
use super::models::{merge_usage, Model, Usage};
use super::parse::parse_lenient;
use super::prompts::{
    CODE_REVIEWER_SYSTEM, FIX_GENERATOR_SYSTEM, LOG_ANALYST_SYSTEM, WORKFLOW_EXPERT_SYSTEM,
};
use super::retry::{correction_directive, run_with_retry, AttemptError, RetryPolicy};
use super::schema::AgentKind;
use crate::error::ForgeError;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

impl AgentKind {
    pub fn system_prompt(&self) -> &'static str {
        match self {
            AgentKind::LogAnalyst => LOG_ANALYST_SYSTEM,
            AgentKind::WorkflowExpert => WORKFLOW_EXPERT_SYSTEM,
            AgentKind::CodeReviewer => CODE_REVIEWER_SYSTEM,
            AgentKind::FixGenerator => FIX_GENERATOR_SYSTEM,
        }
    }

    /// Model tier per role: cheap classification up front, best reasoning
    /// for the fix itself.
    pub fn model(&self) -> Model {
        match self {
            AgentKind::LogAnalyst => Model::Speed,
            AgentKind::WorkflowExpert | AgentKind::CodeReviewer => Model::Balanced,
            AgentKind::FixGenerator => Model::Smart,
        }
    }
}

/// Outcome of a single expert run.
#[derive(Debug)]
pub struct AgentRun<T> {
    pub report: T,
    pub retries_used: u32,
    pub usage: Option<Usage>,
}

/// Runs one expert role against the backend.
pub struct AgentRunner<'a> {
    pub backend: &'a dyn ChatBackend,
    pub policy: RetryPolicy,
    pub budget_override: Option<usize>,
}

impl<'a> AgentRunner<'a> {
    pub fn new(backend: &'a dyn ChatBackend, policy: RetryPolicy, budget_override: Option<usize>) -> Self {
        Self {
            backend,
            policy,
            budget_override,
        }
    }

    fn budget_for(&self, model: Model) -> TokenBudget {
        match self.budget_override {
            Some(cap) => TokenBudget::with_cap(cap),
            None => TokenBudget::for_model(model),
        }
    }

    /// Run `kind` with the given user prompt and deserialize its report.
    pub async fn run<T: serde::de::DeserializeOwned>(
        &self,
        kind: AgentKind,
        user_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentRun<T>, ForgeError> {
        let model = kind.model();
        let system = kind.system_prompt();
        let budget = self.budget_for(model);

        let check = budget.check(system, user_prompt, "");
        if !check.within_budget {
            return Err(ForgeError::BudgetExceeded {
                used: check.input_tokens,
                budget: budget.ceiling(),
            });
        }

        let usage_total: Arc<Mutex<Option<Usage>>> = Arc::new(Mutex::new(None));
        let usage_for_attempts = usage_total.clone();

        let outcome = run_with_retry(&self.policy, kind.name(), cancel, |_, violations| {
            let usage_total = usage_for_attempts.clone();
            let user = match &violations {
                Some(v) => format!("{}\n\n{}", user_prompt, correction_directive(v)),
                None => user_prompt.to_string(),
            };
            async move {
                let reply = self
                    .backend
                    .complete(system, &user, model, true)
                    .await
                    .map_err(|e| AttemptError::Transport(e.to_string()))?;

                {
                    let mut total = usage_total.lock().expect("usage lock");
                    *total = merge_usage(total.take(), reply.usage.clone());
                }

                let value: Value = parse_lenient(&reply.content)
                    .map_err(|e| AttemptError::Schema(vec![format!("response: not valid JSON ({})", e)]))?;

                let schema_violations = kind.validate(&value);
                if !schema_violations.is_empty() {
                    return Err(AttemptError::Schema(schema_violations));
                }

                serde_json::from_value::<T>(value)
                    .map_err(|e| AttemptError::Schema(vec![format!("response: {}", e)]))
            }
        })
        .await?;

        let usage = usage_total.lock().expect("usage lock").take();
        Ok(AgentRun {
            report: outcome.value,
            retries_used: outcome.retries_used,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::schema::LogAnalystReport;
    use crate::llm::testing::ScriptedBackend;

    fn valid_analyst_json() -> String {
        r#"{
            "failureType": "auth",
            "severity": "critical",
            "summary": "publish rejected",
            "rootCauseLines": ["npm ERR! code E403"],
            "contextLines": [],
            "suggestedSearchTerms": ["E403"]
        }"#
        .to_string()
    }

    #[tokio::test]
    async fn test_run_valid_response() {
        let backend = ScriptedBackend::new(vec![Ok(valid_analyst_json())]);
        let runner = AgentRunner::new(&backend, RetryPolicy::pipeline(), None);
        let cancel = CancellationToken::new();

        let run: AgentRun<LogAnalystReport> = runner
            .run(AgentKind::LogAnalyst, "log snippet", &cancel)
            .await
            .unwrap();
        assert_eq!(run.report.failure_type, "auth");
        assert_eq!(run.retries_used, 0);
    }

    #[tokio::test]
    async fn test_run_recovers_from_malformed_json() {
        let backend = ScriptedBackend::new(vec![
            Ok("{ this is not json".to_string()),
            Ok("{\"failureType\": \"martian\"}".to_string()),
            Ok(valid_analyst_json()),
        ]);
        let runner = AgentRunner::new(
            &backend,
            RetryPolicy {
                initial_backoff: std::time::Duration::from_millis(1),
                ..RetryPolicy::pipeline()
            },
            None,
        );
        let cancel = CancellationToken::new();

        let run: AgentRun<LogAnalystReport> = runner
            .run(AgentKind::LogAnalyst, "log snippet", &cancel)
            .await
            .unwrap();
        assert_eq!(run.retries_used, 2);

        // Every retry prompt carried a correction directive.
        let prompts = backend.prompts();
        assert!(!prompts[0].contains("violated the required schema"));
        assert!(prompts[1].contains("violated the required schema"));
        assert!(prompts[2].contains("failureType"));
    }

    #[tokio::test]
    async fn test_run_budget_exceeded() {
        let backend = ScriptedBackend::new(vec![Ok(valid_analyst_json())]);
        let runner = AgentRunner::new(&backend, RetryPolicy::pipeline(), Some(50));
        let cancel = CancellationToken::new();

        let big_prompt = "word ".repeat(2000);
        let result: Result<AgentRun<LogAnalystReport>, _> = runner
            .run(AgentKind::LogAnalyst, &big_prompt, &cancel)
            .await;
        assert!(matches!(result, Err(ForgeError::BudgetExceeded { .. })));
        // The backend was never called.
        assert_eq!(backend.prompts().len(), 0);
    }

    #[tokio::test]
    async fn test_usage_accumulates_across_attempts() {
        let mut backend = ScriptedBackend::new(vec![
            Ok("not json at all".to_string()),
            Ok(valid_analyst_json()),
        ]);
        backend.usage_per_reply(10, 5);
        let runner = AgentRunner::new(
            &backend,
            RetryPolicy {
                initial_backoff: std::time::Duration::from_millis(1),
                ..RetryPolicy::pipeline()
            },
            None,
        );
        let cancel = CancellationToken::new();

        let run: AgentRun<LogAnalystReport> = runner
            .run(AgentKind::LogAnalyst, "log", &cancel)
            .await
            .unwrap();
        let usage = run.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.completion_tokens, 10);
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust_to_backend_unavailable() {
        let backend = ScriptedBackend::new(vec![
            Err("connection refused".to_string()),
            Err("connection refused".to_string()),
            Err("connection refused".to_string()),
        ]);
        let runner = AgentRunner::new(
            &backend,
            RetryPolicy {
                initial_backoff: std::time::Duration::from_millis(1),
                ..RetryPolicy::pipeline()
            },
            None,
        );
        let cancel = CancellationToken::new();

        let result: Result<AgentRun<LogAnalystReport>, _> =
            runner.run(AgentKind::LogAnalyst, "log", &cancel).await;
        assert!(matches!(result, Err(ForgeError::BackendUnavailable(_))));
    }
}
