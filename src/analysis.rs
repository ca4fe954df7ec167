//! Failure analysis: confidence scoring and blast-radius estimation
//!
//! Combines the rule engine's events into an immutable `FailureAnalysis`
//! record carrying a composite confidence score and an estimate of how far
//! the failure reaches.

use crate::prune::PruneStats;
use crate::redact::RedactionStats;
use crate::rules::{FailureEvent, FailureType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// What the scorer recommends before the gate has its say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestedAction {
    AutoApply,
    ManualReview,
    Escalate,
}

/// One signal that fed the composite score.
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceFactor {
    pub name: &'static str,
    pub weight: f64,
    pub matched: bool,
    pub reason: String,
}

/// Composite confidence in the classification.
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceMetrics {
    /// Arithmetic mean of the factor weights, capped at 1.0, 2 decimals.
    pub score: f64,
    pub factors: Vec<ConfidenceFactor>,
    pub suggested_action: SuggestedAction,
}

/// Round to two decimal places; scores are compared against thresholds and
/// must not carry float noise.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Info => 0.40,
        Severity::Warning => 0.65,
        Severity::Error => 0.85,
        Severity::Critical => 0.95,
    }
}

fn type_certainty(failure_type: FailureType) -> f64 {
    match failure_type {
        FailureType::Auth => 0.95,
        FailureType::Env => 0.92,
        FailureType::Build => 0.90,
        FailureType::Deploy => 0.88,
        FailureType::Test => 0.85,
        FailureType::Timeout => 0.80,
        FailureType::Lint => 0.75,
        FailureType::Network => 0.70,
        FailureType::Unknown => 0.30,
    }
}

impl ConfidenceMetrics {
    /// Score one classified event.
    pub fn score_event(event: &FailureEvent) -> Self {
        let fallback = event.rule_id == "generic-error";
        let rule_weight = if fallback { 0.5 } else { event.rule_confidence };

        let context_weight = (0.1 * event.context.len() as f64).min(0.3);

        let trace_weight = match &event.stack_trace {
            Some(trace) if trace.len() > 50 => 0.20,
            _ => 0.0,
        };

        let factors = vec![
            ConfidenceFactor {
                name: "rule-match",
                weight: rule_weight,
                matched: !fallback,
                reason: format!("rule `{}` fired", event.rule_id),
            },
            ConfidenceFactor {
                name: "severity-alignment",
                weight: severity_weight(event.severity),
                matched: true,
                reason: format!("severity {:?}", event.severity),
            },
            ConfidenceFactor {
                name: "context-richness",
                weight: context_weight,
                matched: !event.context.is_empty(),
                reason: format!("{} context keys extracted", event.context.len()),
            },
            ConfidenceFactor {
                name: "type-certainty",
                weight: type_certainty(event.failure_type),
                matched: event.failure_type != FailureType::Unknown,
                reason: format!("failure type {}", event.failure_type.as_str()),
            },
            ConfidenceFactor {
                name: "stack-trace",
                weight: trace_weight,
                matched: trace_weight > 0.0,
                reason: if trace_weight > 0.0 {
                    "non-trivial stack trace attached".to_string()
                } else {
                    "no stack trace".to_string()
                },
            },
        ];

        // Rule, severity, and type are averaged; context richness and the
        // stack trace are bonuses on top. The cap at 1.0 is what keeps the
        // bonuses from overflowing the scale.
        let base = (rule_weight + severity_weight(event.severity) + type_certainty(event.failure_type)) / 3.0;
        let score = round2((base + context_weight + trace_weight).min(1.0));

        ConfidenceMetrics {
            score,
            suggested_action: suggested_action_for(score),
            factors,
        }
    }

    /// Boost from externally supplied boolean signals: 0.05 each, at most
    /// +0.20, capped at 1.0.
    pub fn apply_boost(&mut self, signals: &[(&str, bool)]) {
        let matched = signals.iter().filter(|(_, on)| *on).count();
        if matched == 0 {
            return;
        }
        let boost = (0.05 * matched as f64).min(0.20);
        self.score = round2((self.score + boost).min(1.0));
        self.suggested_action = suggested_action_for(self.score);
        for (name, on) in signals {
            self.factors.push(ConfidenceFactor {
                name: "context-signal",
                weight: if *on { 0.05 } else { 0.0 },
                matched: *on,
                reason: format!("signal `{}`", name),
            });
        }
    }
}

fn suggested_action_for(score: f64) -> SuggestedAction {
    if score >= 0.9 {
        SuggestedAction::AutoApply
    } else if score < 0.6 {
        SuggestedAction::Escalate
    } else {
        SuggestedAction::ManualReview
    }
}

/// How far the failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlastLevel {
    Low,
    Medium,
    High,
}

impl BlastLevel {
    fn escalate(self) -> Self {
        match self {
            BlastLevel::Low => BlastLevel::Medium,
            BlastLevel::Medium | BlastLevel::High => BlastLevel::High,
        }
    }
}

/// Optional workflow metadata supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMeta {
    /// Matrix axis values for the failing job, if it runs in a matrix.
    pub matrix_entries: Vec<String>,
    /// Jobs declared as depending on the failing job.
    pub dependent_jobs: Vec<String>,
    /// Whether the failing job is on the declared critical path.
    pub critical_path: bool,
}

/// Estimated downstream impact of a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadius {
    pub level: BlastLevel,
    pub affected_areas: BTreeSet<String>,
    pub dependents: Vec<String>,
    pub risk_factors: Vec<String>,
    pub reasoning: String,
}

const ESCALATING_STEP_KEYWORDS: &[&str] = &[
    "setup",
    "build",
    "compile",
    "deploy",
    "publish",
    "release",
    "authenticate",
    "login",
];

impl BlastRadius {
    /// Estimate impact from the primary event and optional workflow metadata.
    ///
    /// Escalation is monotone and bounded at `High`.
    pub fn estimate(event: &FailureEvent, meta: Option<&WorkflowMeta>) -> Self {
        let mut level = match event.failure_type {
            FailureType::Build | FailureType::Deploy | FailureType::Auth => BlastLevel::High,
            FailureType::Lint => BlastLevel::Low,
            _ => BlastLevel::Medium,
        };
        let mut affected_areas = BTreeSet::new();
        let mut dependents = Vec::new();
        let mut risk_factors = Vec::new();

        let step_lower = event.step.to_lowercase();
        if let Some(keyword) = ESCALATING_STEP_KEYWORDS
            .iter()
            .find(|k| step_lower.contains(**k))
        {
            level = level.escalate();
            risk_factors.push(format!("failure inside `{}` step", keyword));
        }

        if let Some(meta) = meta {
            if !meta.matrix_entries.is_empty() {
                for entry in &meta.matrix_entries {
                    affected_areas.insert(format!("matrix:{}", entry));
                }
                risk_factors.push(format!(
                    "matrix job fans out across {} variants",
                    meta.matrix_entries.len()
                ));
            }
            if !meta.dependent_jobs.is_empty() {
                dependents.extend(meta.dependent_jobs.iter().cloned());
                risk_factors.push(format!("{} dependent jobs blocked", dependents.len()));
            }
            if meta.critical_path {
                level = level.escalate();
                risk_factors.push("job is on the declared critical path".to_string());
            }
        }

        match event.failure_type {
            FailureType::Auth => {
                affected_areas.insert("authentication-layer".to_string());
            }
            FailureType::Build => {
                affected_areas.insert("build-pipeline".to_string());
            }
            FailureType::Deploy => {
                level = BlastLevel::High;
            }
            _ => {}
        }

        let reasoning = format!(
            "A {} failure in step `{}` is rated {:?} impact: {}.",
            event.failure_type.as_str(),
            event.step,
            level,
            if risk_factors.is_empty() {
                "no additional escalation factors".to_string()
            } else {
                risk_factors.join("; ")
            }
        );

        BlastRadius {
            level,
            affected_areas,
            dependents,
            risk_factors,
            reasoning,
        }
    }
}

/// Immutable record of one classification pass.
#[derive(Debug, Clone, Serialize)]
pub struct FailureAnalysis {
    pub id: Uuid,
    pub events: Vec<FailureEvent>,
    pub primary: FailureEvent,
    pub confidence: ConfidenceMetrics,
    pub blast_radius: BlastRadius,
    pub redaction: RedactionStats,
    pub pruning: PruneStats,
    pub duration_ms: u64,
}

impl FailureAnalysis {
    /// Assemble the analysis. `events` must be non-empty; the caller
    /// converts an empty classification into `NoFailureDetected`.
    pub fn assemble(
        events: Vec<FailureEvent>,
        meta: Option<&WorkflowMeta>,
        redaction: RedactionStats,
        pruning: PruneStats,
        duration_ms: u64,
    ) -> Self {
        let primary = select_primary(&events).clone();
        let confidence = ConfidenceMetrics::score_event(&primary);
        let blast_radius = BlastRadius::estimate(&primary, meta);
        FailureAnalysis {
            id: Uuid::new_v4(),
            events,
            primary,
            confidence,
            blast_radius,
            redaction,
            pruning,
            duration_ms,
        }
    }
}

/// Highest severity wins; ties go to the earliest occurrence.
fn select_primary(events: &[FailureEvent]) -> &FailureEvent {
    events
        .iter()
        .max_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(b.line_number.cmp(&a.line_number))
        })
        .expect("assemble requires a non-empty event list")
}
