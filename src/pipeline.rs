//! Pipeline driver
//!
//! Glues the stages end to end: redact, prune, classify, score, orchestrate
//! the experts, synthesise and validate the patch, gate, dry-run, apply.
//! The audit journal sees every stage; cancellation and an optional
//! deadline are enforced between suspension points.

use crate::analysis::{FailureAnalysis, WorkflowMeta};
use crate::apply::{Applicator, ApplicationRecord, ApplyOptions};
use crate::audit::{AuditEntry, AuditEvent, AuditJournal, AuditStatus};
use crate::config::Config;
use crate::diff::{compute_patch, FilePatch, DEFAULT_CONTEXT};
use crate::dryrun::{simulate, DryRunOptions, DryRunPlan};
use crate::error::ForgeError;
use crate::gate::{decide, GateAction, GateDecision, GateInput};
use crate::llm::{
    AgentRunner, ChatBackend, ExpertInput, Model, Orchestrator, PipelineSummary, RetryPolicy,
    StreamChunk,
};
use crate::llm::budget::TokenBudget;
use crate::prune::prune;
use crate::redact::redact;
use crate::rules::{classify, Severity};
use crate::validate::{validate_files, ValidationReport};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Hard ceiling on accepted log size.
const MAX_LOG_BYTES: usize = 20 * 1024 * 1024;

/// Caller-tunable knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Workflow metadata for the blast-radius estimator.
    pub workflow_meta: Option<WorkflowMeta>,
    /// Write the fix when the gate allows it.
    pub apply: bool,
    /// Overall wall-clock budget for the run.
    pub deadline: Option<Duration>,
}

/// Everything a run produced, including partial results when the gate or
/// the applicator stopped the pipeline.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub analysis: FailureAnalysis,
    pub summary: Option<PipelineSummary>,
    pub patches: Vec<FilePatch>,
    pub validation: ValidationReport,
    pub decision: Option<GateDecision>,
    pub plan: Option<DryRunPlan>,
    pub record: Option<ApplicationRecord>,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    backend: Option<&'a dyn ChatBackend>,
    journal: &'a AuditJournal,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        backend: Option<&'a dyn ChatBackend>,
        journal: &'a AuditJournal,
    ) -> Self {
        Self {
            config,
            backend,
            journal,
        }
    }

    /// Run the full pipeline against `root`.
    pub async fn run(
        &self,
        raw_log: String,
        workflow_config: String,
        change_set: String,
        root: &Path,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, ForgeError> {
        match options.deadline {
            Some(deadline) => {
                let millis = deadline.as_millis() as u64;
                tokio::select! {
                    _ = cancel.cancelled() => Err(ForgeError::Cancelled),
                    result = tokio::time::timeout(
                        deadline,
                        self.run_inner(raw_log, workflow_config, change_set, root, &options, &cancel, None),
                    ) => result.map_err(|_| ForgeError::TimedOut(millis))?,
                }
            }
            None => {
                self.run_inner(raw_log, workflow_config, change_set, root, &options, &cancel, None)
                    .await
            }
        }
    }

    /// Streaming variant: expert chunks are forwarded to `tx`.
    pub async fn run_streaming(
        &self,
        raw_log: String,
        workflow_config: String,
        change_set: String,
        root: &Path,
        options: PipelineOptions,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<PipelineOutcome, ForgeError> {
        self.run_inner(
            raw_log,
            workflow_config,
            change_set,
            root,
            &options,
            &cancel,
            Some(tx),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        raw_log: String,
        workflow_config: String,
        change_set: String,
        root: &Path,
        options: &PipelineOptions,
        cancel: &CancellationToken,
        stream: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<PipelineOutcome, ForgeError> {
        let started = Instant::now();

        if raw_log.trim().is_empty() {
            return Err(ForgeError::InputInvalid("log is empty".to_string()));
        }
        if raw_log.len() > MAX_LOG_BYTES {
            return Err(ForgeError::InputInvalid(format!(
                "log is {} bytes, over the {} byte limit",
                raw_log.len(),
                MAX_LOG_BYTES
            )));
        }

        // C1: the raw log is consumed here and never leaves the host.
        let redacted = redact(raw_log, self.config.aggressive_redaction);
        self.journal.record(AuditEntry::new(
            AuditEvent::SecretsScan,
            "pipeline",
            "ci-log",
            "redact",
            AuditStatus::Success,
            format!(
                "{} secrets masked, risk {:?}",
                redacted.stats.secrets_found, redacted.stats.risk
            ),
        ));

        // C2.
        let pruned = prune(
            &redacted.text,
            self.config.prune_head_lines,
            self.config.prune_tail_lines,
        );

        // C3: an empty classification is fatal to the run.
        let events = classify(&pruned.text);
        if events.is_empty() {
            return Err(ForgeError::NoFailureDetected);
        }

        // C4 + C5.
        let analysis = FailureAnalysis::assemble(
            events,
            options.workflow_meta.as_ref(),
            redacted.stats.clone(),
            pruned.stats(),
            started.elapsed().as_millis() as u64,
        );
        tracing::info!(
            failure_type = analysis.primary.failure_type.as_str(),
            score = analysis.confidence.score,
            "failure classified"
        );

        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }

        // Local-only runs stop after classification.
        let Some(backend) = self.backend.filter(|_| !self.config.local_only) else {
            return Ok(PipelineOutcome {
                analysis,
                summary: None,
                patches: Vec::new(),
                validation: ValidationReport::default(),
                decision: None,
                plan: None,
                record: None,
            });
        };

        // C10, with C6-C9 inside.
        let budget = match self.config.token_budget {
            Some(cap) => TokenBudget::with_cap(cap),
            None => TokenBudget::for_model(Model::Smart),
        };
        let snippet = budget.optimize_log_snippet(&pruned.text, budget.ceiling() / 4);
        let policy = RetryPolicy {
            max_attempts: self.config.max_retries,
            attempt_timeout: Duration::from_secs(self.config.request_timeout_secs.min(15)),
            ..RetryPolicy::pipeline()
        };
        let runner = AgentRunner::new(backend, policy, self.config.token_budget);
        let orchestrator = Orchestrator::new(runner);
        let input = ExpertInput {
            log_snippet: snippet,
            workflow_config,
            change_set,
        };

        let summary = match stream {
            Some(tx) => orchestrator.run_streaming(&input, cancel, tx).await,
            None => orchestrator.run(&input, cancel).await,
        }
        .map_err(|failure| {
            tracing::warn!(
                "expert pipeline stopped early; prior outputs: analyst={} workflow={} reviewer={}",
                failure.partial.log_analyst.is_some(),
                failure.partial.workflow_expert.is_some(),
                failure.partial.code_reviewer.is_some(),
            );
            failure.error
        })?;

        let fix = &summary.agents.fix_generator;
        self.journal.record(
            AuditEntry::new(
                AuditEvent::FixGenerated,
                "pipeline",
                &fix.fix_file,
                "generate",
                AuditStatus::Success,
                format!("confidence {:.2}", fix.confidence),
            )
            .with_metadata("analysis_id", analysis.id.to_string()),
        );

        // C11: the fix is a full post-image; the diff engine turns it into
        // a patch against what is on disk.
        let target = root.join(&fix.fix_file);
        let current = if target.exists() {
            fs::read_to_string(&target)
                .map_err(|e| ForgeError::InputInvalid(format!("cannot read `{}`: {}", fix.fix_file, e)))?
        } else {
            String::new()
        };
        let patches: Vec<FilePatch> =
            compute_patch(&fix.fix_file, &current, &fix.fix_content, DEFAULT_CONTEXT)
                .into_iter()
                .collect();

        // C12 over the proposed post-images.
        let post_images: Vec<(String, String)> = patches
            .iter()
            .map(|p| (p.path.clone(), fix.fix_content.clone()))
            .collect();
        let validation = validate_files(&post_images);
        self.journal.record(AuditEntry::new(
            AuditEvent::ValidationCheck,
            "pipeline",
            &fix.fix_file,
            "validate",
            if validation.has_errors() {
                AuditStatus::Failure
            } else {
                AuditStatus::Success
            },
            format!(
                "{} errors, {} warnings",
                validation.files.iter().map(|f| f.errors.len()).sum::<usize>(),
                validation.warning_count()
            ),
        ));

        // C13: the gate scores the Fix Generator's confidence against the
        // classifier's severity and the change-set shape. Touched paths
        // include the workflow keys the expert wants to edit, so a
        // `permissions` or secret-bearing change trips the security lexicon
        // even when the file path itself is bland.
        let mut touched: Vec<String> = patches.iter().map(|p| p.path.clone()).collect();
        touched.extend(
            summary
                .agents
                .workflow_expert
                .yaml_changes
                .iter()
                .map(|c| c.path.clone()),
        );
        let gate_input = GateInput {
            score: summary.overall_confidence,
            is_critical_failure: analysis.primary.severity == Severity::Critical,
            touched_paths: &touched,
            validation: &validation,
            deleted_files: patches.iter().filter(|p| p.is_deleted).count(),
            new_files: patches.iter().filter(|p| p.is_new).count(),
        };
        let decision = decide(&gate_input, self.config);
        tracing::info!(action = ?decision.action, "gate decided");

        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }

        // C14: always produce the plan so review paths can show it.
        let plan = if patches.is_empty() {
            None
        } else {
            Some(simulate(root, &patches, DryRunOptions::default(), cancel))
        };

        // C15: only on an auto-apply verdict, and only when asked to.
        let record = if options.apply
            && decision.action == GateAction::AutoApply
            && !patches.is_empty()
        {
            let applicator = Applicator::new(root, self.journal);
            let apply_options = ApplyOptions {
                auto_apply_override: false,
                dry_run_first: self.config.dry_run_before_apply,
            };
            Some(applicator.apply_patches(&patches, &decision, &apply_options)?)
        } else {
            None
        };

        Ok(PipelineOutcome {
            analysis,
            summary: Some(summary),
            patches,
            validation,
            decision: Some(decision),
            plan,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedBackend;
    use tempfile::tempdir;

    fn config() -> Config {
        Config {
            requires_security_review: false,
            ..Config::default()
        }
    }

    fn fix_reply(file: &str, content: &str, confidence: f64) -> String {
        serde_json::json!({
            "confidence": confidence,
            "fixFile": file,
            "fixStartLine": 1,
            "fixContent": content,
            "explanation": "minimal fix for the logged failure"
        })
        .to_string()
    }

    fn analyst_reply() -> String {
        r#"{"failureType":"auth","severity":"critical","summary":"registry publish forbidden","rootCauseLines":["npm ERR! code E403"],"contextLines":[],"suggestedSearchTerms":["E403"]}"#.to_string()
    }

    fn workflow_reply() -> String {
        r#"{"issueType":"secrets","recommendation":"add the registry token","yamlChanges":[],"riskLevel":"medium"}"#.to_string()
    }

    fn review_reply() -> String {
        r#"{"issuesFound":[],"overallScore":95,"blockers":[]}"#.to_string()
    }

    const AUTH_LOG: &str = "##[group]Run npm publish\nnpm ERR! code E403\n403 Forbidden - PUT https://registry.npmjs.org/pkg";

    #[tokio::test]
    async fn test_empty_log_is_input_invalid() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(&dir.path().join("audit")).unwrap();
        let cfg = config();
        let pipeline = Pipeline::new(&cfg, None, &journal);

        let result = pipeline
            .run(
                "   ".to_string(),
                String::new(),
                String::new(),
                dir.path(),
                PipelineOptions::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ForgeError::InputInvalid(_))));
    }

    #[tokio::test]
    async fn test_clean_log_is_no_failure_detected() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(&dir.path().join("audit")).unwrap();
        let cfg = config();
        let pipeline = Pipeline::new(&cfg, None, &journal);

        let result = pipeline
            .run(
                "all tests green\ndone".to_string(),
                String::new(),
                String::new(),
                dir.path(),
                PipelineOptions::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ForgeError::NoFailureDetected)));
    }

    #[tokio::test]
    async fn test_local_only_stops_after_classification() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(&dir.path().join("audit")).unwrap();
        let mut cfg = config();
        cfg.local_only = true;
        let backend = ScriptedBackend::new(vec![]);
        let pipeline = Pipeline::new(&cfg, Some(&backend), &journal);

        let outcome = pipeline
            .run(
                AUTH_LOG.to_string(),
                String::new(),
                String::new(),
                dir.path(),
                PipelineOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.summary.is_none());
        assert!(outcome.decision.is_none());
        assert_eq!(
            outcome.analysis.primary.failure_type,
            crate::rules::FailureType::Auth
        );
        // The backend was never touched.
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_full_run_produces_patch_and_applies() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("publish.yml"), "name: publish\non: push\njobs:\n  publish:\n    runs-on: ubuntu-latest\n    steps:\n      - run: npm publish\n").unwrap();

        let fixed = "name: publish\non: push\njobs:\n  publish:\n    runs-on: ubuntu-latest\n    steps:\n      - run: npm publish\n        env:\n          NODE_AUTH_TOKEN: ${{ secrets.NPM_TOKEN }}\n";
        let backend = ScriptedBackend::new(vec![
            Ok(analyst_reply()),
            Ok(workflow_reply()),
            Ok(review_reply()),
            Ok(fix_reply("publish.yml", fixed, 0.95)),
        ]);
        let journal = AuditJournal::open(&root.join("audit")).unwrap();
        let mut cfg = config();
        cfg.allow_auto_apply_on_critical = true;
        let pipeline = Pipeline::new(&cfg, Some(&backend), &journal);

        let outcome = pipeline
            .run(
                AUTH_LOG.to_string(),
                "name: publish".to_string(),
                String::new(),
                root,
                PipelineOptions {
                    apply: true,
                    ..PipelineOptions::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.decision.as_ref().unwrap().action, GateAction::AutoApply);
        assert!(outcome.plan.as_ref().unwrap().success);
        assert!(outcome.record.is_some());
        assert_eq!(fs::read_to_string(root.join("publish.yml")).unwrap(), fixed);

        // The journal saw the whole story.
        assert!(!journal.query_by_resource("ci-log").is_empty());
        assert!(!journal.query_by_resource("publish.yml").is_empty());
    }

    #[tokio::test]
    async fn test_critical_failure_blocks_auto_apply_by_default() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("publish.yml"), "name: publish\n").unwrap();

        let backend = ScriptedBackend::new(vec![
            Ok(analyst_reply()),
            Ok(workflow_reply()),
            Ok(review_reply()),
            Ok(fix_reply("publish.yml", "name: publish\nrun-name: retry\n", 0.95)),
        ]);
        let journal = AuditJournal::open(&root.join("audit")).unwrap();
        let cfg = config();
        let pipeline = Pipeline::new(&cfg, Some(&backend), &journal);

        let outcome = pipeline
            .run(
                AUTH_LOG.to_string(),
                String::new(),
                String::new(),
                root,
                PipelineOptions {
                    apply: true,
                    ..PipelineOptions::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // The E403 failure is critical, so auto-apply downgrades.
        let decision = outcome.decision.unwrap();
        assert_eq!(decision.action, GateAction::ManualReview);
        assert!(decision.reasoning.contains("critical"));
        assert!(outcome.record.is_none());
        // Nothing was written.
        assert_eq!(
            fs::read_to_string(root.join("publish.yml")).unwrap(),
            "name: publish\n"
        );
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(&dir.path().join("audit")).unwrap();
        let cfg = config();
        // A backend that never answers inside the deadline.
        struct SlowBackend;
        #[async_trait::async_trait]
        impl ChatBackend for SlowBackend {
            async fn complete(
                &self,
                _system: &str,
                _user: &str,
                _model: Model,
                _json_mode: bool,
            ) -> anyhow::Result<crate::llm::BackendReply> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!()
            }
        }
        let backend = SlowBackend;
        let pipeline = Pipeline::new(&cfg, Some(&backend), &journal);

        let result = pipeline
            .run(
                AUTH_LOG.to_string(),
                String::new(),
                String::new(),
                dir.path(),
                PipelineOptions {
                    deadline: Some(Duration::from_millis(50)),
                    ..PipelineOptions::default()
                },
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ForgeError::TimedOut(_))));
    }
}
