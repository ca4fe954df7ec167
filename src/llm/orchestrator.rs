//! Multi-expert orchestration
//!
//! Four experts run in strict order, each consuming its predecessors'
//! structured outputs: Log Analyst, Workflow Expert, Code Reviewer, Fix
//! Generator. The streaming variant emits ordered, acknowledged chunks and
//! is cancellable at every suspension point.

use super::agents::{AgentRun, AgentRunner};
use super::models::{merge_usage, Usage};
use super::schema::{
    AgentKind, FixReport, LogAnalystReport, ReviewReport, WorkflowReport,
};
use crate::error::ForgeError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inputs the experts reason over.
#[derive(Debug, Clone)]
pub struct ExpertInput {
    /// Budget-optimised log snippet (already redacted and pruned).
    pub log_snippet: String,
    /// Workflow configuration file content.
    pub workflow_config: String,
    /// Unified diff of the change set under suspicion.
    pub change_set: String,
}

/// All four expert outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertOutputs {
    pub log_analyst: LogAnalystReport,
    pub workflow_expert: WorkflowReport,
    pub code_reviewer: ReviewReport,
    pub fix_generator: FixReport,
}

/// Outputs gathered before a mid-pipeline failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialOutputs {
    pub log_analyst: Option<LogAnalystReport>,
    pub workflow_expert: Option<WorkflowReport>,
    pub code_reviewer: Option<ReviewReport>,
}

/// A failed orchestration still carries what the earlier experts produced.
#[derive(Debug)]
pub struct OrchestratorFailure {
    pub error: ForgeError,
    pub partial: PartialOutputs,
}

/// Final object carrying all four outputs plus derived items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub title: String,
    pub summary: String,
    pub agents: ExpertOutputs,
    /// Equal to the Fix Generator's confidence.
    pub overall_confidence: f64,
    pub action_items: Vec<String>,
    /// Backend retries per role, for diagnostics.
    pub retries_used: u32,
    #[serde(skip)]
    pub usage: Option<Usage>,
}

/// One chunk of the streaming variant.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A role started or finished.
    Status { agent: AgentKind, finished: bool },
    /// A role's structured output, serialized.
    Agent { agent: AgentKind, content: String },
    /// The proposed fix, emitted once the Fix Generator completes.
    Fix {
        file: String,
        line: u64,
        content: String,
    },
    /// Terminal chunk.
    Done,
}

pub struct Orchestrator<'a> {
    runner: AgentRunner<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(runner: AgentRunner<'a>) -> Self {
        Self { runner }
    }

    /// Run the four experts in order and emit the summary.
    pub async fn run(
        &self,
        input: &ExpertInput,
        cancel: &CancellationToken,
    ) -> Result<PipelineSummary, OrchestratorFailure> {
        self.run_inner(input, cancel, None).await
    }

    /// Streaming variant. Chunks are delivered in pipeline order; the
    /// bounded channel provides backpressure (the next chunk is not
    /// produced until the consumer has taken the previous one).
    pub async fn run_streaming(
        &self,
        input: &ExpertInput,
        cancel: &CancellationToken,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<PipelineSummary, OrchestratorFailure> {
        self.run_inner(input, cancel, Some(&tx)).await
    }

    async fn run_inner(
        &self,
        input: &ExpertInput,
        cancel: &CancellationToken,
        tx: Option<&mpsc::Sender<StreamChunk>>,
    ) -> Result<PipelineSummary, OrchestratorFailure> {
        let mut partial = PartialOutputs::default();
        let mut usage: Option<Usage> = None;
        let mut retries_used = 0;

        // Log Analyst reads the optimised log snippet.
        let analyst: LogAnalystReport = {
            let run = self
                .step::<LogAnalystReport>(
                    AgentKind::LogAnalyst,
                    format!("CI log (pruned and redacted):\n\n{}", input.log_snippet),
                    cancel,
                    tx,
                    &partial,
                )
                .await?;
            usage = merge_usage(usage.take(), run.usage.clone());
            retries_used += run.retries_used;
            run.report
        };
        partial.log_analyst = Some(analyst.clone());

        // Workflow Expert reads the configuration plus prior context.
        let workflow: WorkflowReport = {
            let prior = json!({ "logAnalyst": &analyst });
            let run = self
                .step::<WorkflowReport>(
                    AgentKind::WorkflowExpert,
                    format!(
                        "Workflow configuration:\n\n{}\n\nPrior findings:\n{}",
                        input.workflow_config, prior
                    ),
                    cancel,
                    tx,
                    &partial,
                )
                .await?;
            usage = merge_usage(usage.take(), run.usage.clone());
            retries_used += run.retries_used;
            run.report
        };
        partial.workflow_expert = Some(workflow.clone());

        // Code Reviewer reads the change set plus prior context.
        let review: ReviewReport = {
            let prior = json!({ "logAnalyst": &analyst, "workflowExpert": &workflow });
            let run = self
                .step::<ReviewReport>(
                    AgentKind::CodeReviewer,
                    format!(
                        "Change set under suspicion:\n\n{}\n\nPrior findings:\n{}",
                        input.change_set, prior
                    ),
                    cancel,
                    tx,
                    &partial,
                )
                .await?;
            usage = merge_usage(usage.take(), run.usage.clone());
            retries_used += run.retries_used;
            run.report
        };
        partial.code_reviewer = Some(review.clone());

        // Fix Generator always receives all three prior outputs plus the log.
        let fix: FixReport = {
            let prior = json!({
                "logAnalyst": &analyst,
                "workflowExpert": &workflow,
                "codeReviewer": &review,
            });
            let run = self
                .step::<FixReport>(
                    AgentKind::FixGenerator,
                    format!(
                        "Prior findings:\n{}\n\nCI log (pruned and redacted):\n\n{}",
                        prior, input.log_snippet
                    ),
                    cancel,
                    tx,
                    &partial,
                )
                .await?;
            usage = merge_usage(usage.take(), run.usage.clone());
            retries_used += run.retries_used;
            run.report
        };

        if let Some(tx) = tx {
            self.emit(
                tx,
                StreamChunk::Fix {
                    file: fix.fix_file.clone(),
                    line: fix.fix_start_line,
                    content: fix.fix_content.clone(),
                },
                cancel,
            )
            .await
            .map_err(|error| OrchestratorFailure {
                error,
                partial: partial.clone(),
            })?;
        }

        let summary = build_summary(analyst, workflow, review, fix, retries_used, usage);

        if let Some(tx) = tx {
            self.emit(tx, StreamChunk::Done, cancel)
                .await
                .map_err(|error| OrchestratorFailure {
                    error,
                    partial: partial.clone(),
                })?;
        }

        Ok(summary)
    }

    /// One role: status chunk, agent run, output chunk.
    async fn step<T>(
        &self,
        kind: AgentKind,
        user_prompt: String,
        cancel: &CancellationToken,
        tx: Option<&mpsc::Sender<StreamChunk>>,
        partial: &PartialOutputs,
    ) -> Result<AgentRun<T>, OrchestratorFailure>
    where
        T: serde::de::DeserializeOwned + Serialize,
    {
        let fail = |error: ForgeError| OrchestratorFailure {
            error,
            partial: partial.clone(),
        };

        if let Some(tx) = tx {
            self.emit(tx, StreamChunk::Status { agent: kind, finished: false }, cancel)
                .await
                .map_err(fail)?;
        }

        let run = self
            .runner
            .run::<T>(kind, &user_prompt, cancel)
            .await
            .map_err(fail)?;

        if let Some(tx) = tx {
            let content = serde_json::to_string(&run.report).unwrap_or_default();
            self.emit(tx, StreamChunk::Agent { agent: kind, content }, cancel)
                .await
                .map_err(fail)?;
            self.emit(tx, StreamChunk::Status { agent: kind, finished: true }, cancel)
                .await
                .map_err(fail)?;
        }

        Ok(run)
    }

    /// Send one chunk; the bounded channel makes this a suspension point.
    async fn emit(
        &self,
        tx: &mpsc::Sender<StreamChunk>,
        chunk: StreamChunk,
        cancel: &CancellationToken,
    ) -> Result<(), ForgeError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ForgeError::Cancelled),
            sent = tx.send(chunk) => sent.map_err(|_| ForgeError::Cancelled),
        }
    }
}

fn build_summary(
    analyst: LogAnalystReport,
    workflow: WorkflowReport,
    review: ReviewReport,
    fix: FixReport,
    retries_used: u32,
    usage: Option<Usage>,
) -> PipelineSummary {
    let mut action_items = Vec::new();
    if workflow.issue_type != "none" && !workflow.recommendation.is_empty() {
        action_items.push(format!("workflow: {}", workflow.recommendation));
    }
    for blocker in &review.blockers {
        action_items.push(format!("blocker: {}", blocker));
    }
    if let Some(test) = &fix.test_suggestion {
        action_items.push(format!("verify: {}", test));
    }

    let title = clamp_chars(
        &format!("{} failure: {}", analyst.failure_type, analyst.summary),
        100,
    );
    let summary_text = clamp_chars(
        &format!("{} Proposed fix: {}", analyst.summary, fix.explanation),
        500,
    );
    let overall_confidence = fix.confidence;

    PipelineSummary {
        title,
        summary: summary_text,
        agents: ExpertOutputs {
            log_analyst: analyst,
            workflow_expert: workflow,
            code_reviewer: review,
            fix_generator: fix,
        },
        overall_confidence,
        action_items,
        retries_used,
        usage,
    }
}

fn clamp_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::retry::RetryPolicy;
    use crate::llm::testing::ScriptedBackend;

    pub(crate) fn analyst_json() -> String {
        r#"{"failureType":"auth","severity":"critical","summary":"registry publish forbidden","rootCauseLines":["npm ERR! code E403"],"contextLines":[],"suggestedSearchTerms":["E403"]}"#.to_string()
    }

    pub(crate) fn workflow_json() -> String {
        r#"{"issueType":"secrets","recommendation":"add registry-url and NODE_AUTH_TOKEN to the setup step","yamlChanges":[{"path":"jobs.publish.steps[0].with.registry-url","oldValue":"","newValue":"https://registry.npmjs.org","reason":"publish requires a registry"}],"riskLevel":"medium"}"#.to_string()
    }

    pub(crate) fn review_json() -> String {
        r#"{"issuesFound":[],"overallScore":90,"blockers":[]}"#.to_string()
    }

    pub(crate) fn fix_json() -> String {
        r#"{"confidence":0.93,"fixFile":".github/workflows/publish.yml","fixStartLine":12,"fixContent":"name: publish\n","explanation":"adds registry-url and NODE_AUTH_TOKEN","testSuggestion":"re-run the publish job"}"#.to_string()
    }

    fn full_script() -> Vec<Result<String, String>> {
        vec![
            Ok(analyst_json()),
            Ok(workflow_json()),
            Ok(review_json()),
            Ok(fix_json()),
        ]
    }

    fn input() -> ExpertInput {
        ExpertInput {
            log_snippet: "npm ERR! code E403".to_string(),
            workflow_config: "name: publish".to_string(),
            change_set: "--- a/package.json".to_string(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: std::time::Duration::from_millis(1),
            ..RetryPolicy::pipeline()
        }
    }

    #[tokio::test]
    async fn test_full_pipeline_order_and_summary() {
        let backend = ScriptedBackend::new(full_script());
        let orchestrator = Orchestrator::new(AgentRunner::new(&backend, fast_policy(), None));
        let cancel = CancellationToken::new();

        let summary = orchestrator.run(&input(), &cancel).await.unwrap();
        assert_eq!(summary.overall_confidence, 0.93);
        assert_eq!(summary.agents.workflow_expert.issue_type, "secrets");
        assert!(summary.title.starts_with("auth failure"));
        assert!(summary
            .action_items
            .iter()
            .any(|item| item.starts_with("workflow:")));

        // Prior context accumulates: the reviewer saw both prior outputs,
        // the fix generator saw all three plus the log snippet.
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[1].contains("logAnalyst"));
        assert!(prompts[2].contains("workflowExpert"));
        assert!(prompts[3].contains("codeReviewer"));
        assert!(prompts[3].contains("npm ERR! code E403"));
    }

    #[tokio::test]
    async fn test_failure_surfaces_partial_outputs() {
        // Workflow expert keeps returning garbage; analyst output survives.
        let backend = ScriptedBackend::new(vec![
            Ok(analyst_json()),
            Ok("nonsense".to_string()),
            Ok("nonsense".to_string()),
            Ok("nonsense".to_string()),
        ]);
        let orchestrator = Orchestrator::new(AgentRunner::new(&backend, fast_policy(), None));
        let cancel = CancellationToken::new();

        let failure = orchestrator.run(&input(), &cancel).await.unwrap_err();
        assert!(matches!(failure.error, ForgeError::SchemaViolation { .. }));
        assert!(failure.partial.log_analyst.is_some());
        assert!(failure.partial.workflow_expert.is_none());
        assert!(failure.partial.code_reviewer.is_none());
    }

    #[tokio::test]
    async fn test_streaming_chunk_order() {
        let backend = ScriptedBackend::new(full_script());
        let orchestrator = Orchestrator::new(AgentRunner::new(&backend, fast_policy(), None));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);

        let consumer = tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk);
            }
            chunks
        });

        orchestrator
            .run_streaming(&input(), &cancel, tx)
            .await
            .unwrap();
        let chunks = consumer.await.unwrap();

        // Per agent: started, output, finished. Then fix and done.
        assert!(matches!(
            chunks[0],
            StreamChunk::Status { agent: AgentKind::LogAnalyst, finished: false }
        ));
        assert!(matches!(
            chunks[1],
            StreamChunk::Agent { agent: AgentKind::LogAnalyst, .. }
        ));
        assert!(matches!(
            chunks[2],
            StreamChunk::Status { agent: AgentKind::LogAnalyst, finished: true }
        ));
        assert!(matches!(
            chunks[3],
            StreamChunk::Status { agent: AgentKind::WorkflowExpert, finished: false }
        ));
        let fix_pos = chunks
            .iter()
            .position(|c| matches!(c, StreamChunk::Fix { .. }))
            .unwrap();
        assert_eq!(fix_pos, chunks.len() - 2);
        assert!(matches!(chunks.last().unwrap(), StreamChunk::Done));
    }

    #[tokio::test]
    async fn test_streaming_cancellation_mid_pipeline() {
        let backend = ScriptedBackend::new(full_script());
        let orchestrator = Orchestrator::new(AgentRunner::new(&backend, fast_policy(), None));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);

        // Take the first chunk, then cancel and drop the receiver.
        let cancel_clone = cancel.clone();
        let consumer = tokio::spawn(async move {
            let first = rx.recv().await;
            cancel_clone.cancel();
            drop(rx);
            first
        });

        let result = orchestrator.run_streaming(&input(), &cancel, tx).await;
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err().error, ForgeError::Cancelled));
        assert!(consumer.await.unwrap().is_some());
    }

    #[test]
    fn test_clamp_chars() {
        assert_eq!(clamp_chars("short", 10), "short");
        assert_eq!(clamp_chars("0123456789abc", 10).chars().count(), 10);
    }
}
