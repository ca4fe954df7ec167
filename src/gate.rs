//! Confidence gate
//!
//! A pure decision function from (score, risk flags, thresholds) to an
//! action. First matching rule wins; threshold comparisons are inclusive,
//! so a score exactly on a boundary selects the higher tier.

use crate::config::Config;
use crate::validate::ValidationReport;
use serde::{Deserialize, Serialize};

/// Terminal action for a proposed fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateAction {
    AutoApply,
    ManualReview,
    Escalate,
    Reject,
}

/// The gate's verdict with its reasoning trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub action: GateAction,
    pub confidence: f64,
    pub reasoning: String,
    pub risks: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Everything the gate looks at. It reads nothing else.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub score: f64,
    pub is_critical_failure: bool,
    pub touched_paths: &'a [String],
    pub validation: &'a ValidationReport,
    pub deleted_files: usize,
    pub new_files: usize,
}

const SECURITY_LEXICON: &[&str] = &[
    "auth", "secret", "password", "token", "credential", "permission", "access", "security",
];

const PERFORMANCE_LEXICON: &[&str] = &[
    "cache", "database", "query", "optimization", "performance", "index",
];

/// Paths whose modification is inherently riskier than their diff size.
const CRITICAL_PATHS: &[&str] = &[
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    ".github/workflows",
    "main.",
    "index.",
];

fn matches_lexicon(paths: &[String], lexicon: &[&str]) -> Option<String> {
    for path in paths {
        let lower = path.to_lowercase();
        if let Some(term) = lexicon.iter().find(|t| lower.contains(**t)) {
            return Some(format!("`{}` matches `{}`", path, term));
        }
    }
    None
}

/// Decide what happens to the proposed fix.
pub fn decide(input: &GateInput, config: &Config) -> GateDecision {
    let risks = collect_risks(input);
    let mut recommendations = Vec::new();

    // 1. Validation errors are a hard stop.
    if input.validation.has_errors() {
        recommendations.push("Fix the validation errors and regenerate the patch".to_string());
        return GateDecision {
            action: GateAction::Reject,
            confidence: input.score,
            reasoning: format!(
                "validation reported errors: {}",
                input.validation.error_summary()
            ),
            risks,
            recommendations,
        };
    }

    // 2. Security-sensitive paths always get human eyes.
    if config.requires_security_review {
        if let Some(hit) = matches_lexicon(input.touched_paths, SECURITY_LEXICON) {
            recommendations.push("Have a security owner review the touched paths".to_string());
            return GateDecision {
                action: GateAction::ManualReview,
                confidence: input.score,
                reasoning: format!("security review required: {}", hit),
                risks,
                recommendations,
            };
        }
    }

    // 3. Performance-sensitive paths, when configured.
    if config.requires_performance_review {
        if let Some(hit) = matches_lexicon(input.touched_paths, PERFORMANCE_LEXICON) {
            recommendations.push("Benchmark the affected paths before merging".to_string());
            return GateDecision {
                action: GateAction::ManualReview,
                confidence: input.score,
                reasoning: format!("performance review required: {}", hit),
                risks,
                recommendations,
            };
        }
    }

    // 4-7. Threshold ladder, inclusive at every boundary.
    if input.score >= config.auto_apply_threshold {
        if input.is_critical_failure && !config.allow_auto_apply_on_critical {
            recommendations
                .push("Review manually; enable allow_auto_apply_on_critical to bypass".to_string());
            return GateDecision {
                action: GateAction::ManualReview,
                confidence: input.score,
                reasoning: format!(
                    "score {:.2} clears the auto-apply threshold but the failure is critical and auto-apply on critical failures is disabled",
                    input.score
                ),
                risks,
                recommendations,
            };
        }
        recommendations.push("Safe to apply automatically".to_string());
        return GateDecision {
            action: GateAction::AutoApply,
            confidence: input.score,
            reasoning: format!(
                "score {:.2} at or above the auto-apply threshold {:.2}",
                input.score, config.auto_apply_threshold
            ),
            risks,
            recommendations,
        };
    }

    if input.score >= config.manual_review_threshold {
        recommendations.push("Review the proposed diff before applying".to_string());
        return GateDecision {
            action: GateAction::ManualReview,
            confidence: input.score,
            reasoning: format!(
                "score {:.2} in the manual-review band [{:.2}, {:.2})",
                input.score, config.manual_review_threshold, config.auto_apply_threshold
            ),
            risks,
            recommendations,
        };
    }

    if input.score >= config.escalate_threshold {
        recommendations.push("Escalate to an on-call engineer with the analysis attached".to_string());
        return GateDecision {
            action: GateAction::Escalate,
            confidence: input.score,
            reasoning: format!(
                "score {:.2} in the escalation band [{:.2}, {:.2})",
                input.score, config.escalate_threshold, config.manual_review_threshold
            ),
            risks,
            recommendations,
        };
    }

    recommendations.push("Discard the proposal; confidence is too low to act on".to_string());
    GateDecision {
        action: GateAction::Reject,
        confidence: input.score,
        reasoning: format!(
            "score {:.2} below the escalation threshold {:.2}",
            input.score, config.escalate_threshold
        ),
        risks,
        recommendations,
    }
}

fn collect_risks(input: &GateInput) -> Vec<String> {
    let mut risks = Vec::new();

    let warnings = input.validation.warning_count();
    if warnings > 0 {
        risks.push(format!("{} validation warnings", warnings));
    }

    for path in input.touched_paths {
        if CRITICAL_PATHS.iter().any(|c| path.contains(c)) {
            risks.push(format!("touches critical path `{}`", path));
        }
    }

    if input.touched_paths.len() > 5 {
        risks.push(format!("large change set ({} files)", input.touched_paths.len()));
    }
    if input.deleted_files > 0 {
        risks.push(format!("{} file deletions", input.deleted_files));
    }
    if input.new_files > 3 {
        risks.push(format!("{} new files", input.new_files));
    }

    risks
}
