//! Dry-run simulation
//!
//! Produces an application plan without touching the working tree. Every
//! patch becomes a plan step with preconditions checked and the application
//! simulated in memory; optional passes add syntax validation, conflict
//! detection, and a synthetic performance estimate.

use crate::diff::{apply_patch, FilePatch};
use crate::validate::validate_file;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Threshold above which a change is flagged as large.
const LARGE_CHANGE_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanAction {
    Create,
    Modify,
    Delete,
    ValidateSyntax,
    CheckConflicts,
    EstimatePerformance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Warning,
    Error,
}

/// Projected impact of the whole application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub action: PlanAction,
    pub target: String,
    pub status: StepStatus,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_steps: usize,
    pub files_affected: usize,
    pub lines_changed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunPlan {
    pub steps: Vec<PlanStep>,
    pub summary: PlanSummary,
    pub success: bool,
    pub rollback_plan: String,
    pub impact: Impact,
    pub cancelled: bool,
}

/// Which optional passes to run.
#[derive(Debug, Clone, Copy)]
pub struct DryRunOptions {
    pub validate_syntax: bool,
    pub check_conflicts: bool,
    pub estimate_performance: bool,
}

impl Default for DryRunOptions {
    fn default() -> Self {
        Self {
            validate_syntax: true,
            check_conflicts: true,
            estimate_performance: true,
        }
    }
}

/// Simulate applying `patches` under `root`.
///
/// Never writes. Cancellation returns the accumulated plan with
/// `cancelled = true` rather than an error.
pub fn simulate(
    root: &Path,
    patches: &[FilePatch],
    options: DryRunOptions,
    cancel: &CancellationToken,
) -> DryRunPlan {
    let mut steps = Vec::new();
    let mut post_images: HashMap<String, String> = HashMap::new();
    let mut lines_changed = 0usize;
    let mut index = 0usize;

    for patch in patches {
        if cancel.is_cancelled() {
            return finish(steps, lines_changed, patches, true);
        }

        let target = root.join(&patch.path);
        let exists = target.exists();
        let mut details = BTreeMap::new();
        details.insert("lines".to_string(), patch.lines_changed().to_string());

        let (action, status, message) = if patch.is_new {
            if exists {
                (
                    PlanAction::Create,
                    StepStatus::Error,
                    format!("target `{}` already exists", patch.path),
                )
            } else {
                let content = match apply_patch("", patch) {
                    Ok(content) => content,
                    Err(err) => {
                        steps.push(PlanStep {
                            index,
                            action: PlanAction::Create,
                            target: patch.path.clone(),
                            status: StepStatus::Error,
                            message: err,
                            details,
                        });
                        index += 1;
                        continue;
                    }
                };
                post_images.insert(patch.path.clone(), content);
                (
                    PlanAction::Create,
                    StepStatus::Success,
                    format!("create `{}`", patch.path),
                )
            }
        } else if patch.is_deleted {
            if exists {
                (
                    PlanAction::Delete,
                    StepStatus::Success,
                    format!("delete `{}`", patch.path),
                )
            } else {
                (
                    PlanAction::Delete,
                    StepStatus::Error,
                    format!("target `{}` does not exist", patch.path),
                )
            }
        } else if !exists {
            (
                PlanAction::Modify,
                StepStatus::Error,
                format!("target `{}` does not exist", patch.path),
            )
        } else {
            match fs::read_to_string(&target) {
                Ok(current) => match apply_patch(&current, patch) {
                    Ok(content) => {
                        post_images.insert(patch.path.clone(), content);
                        (
                            PlanAction::Modify,
                            StepStatus::Success,
                            format!("modify `{}`", patch.path),
                        )
                    }
                    Err(err) => (
                        PlanAction::Modify,
                        StepStatus::Error,
                        format!("patch does not apply: {}", err),
                    ),
                },
                Err(err) => (
                    PlanAction::Modify,
                    StepStatus::Error,
                    format!("cannot read target: {}", err),
                ),
            }
        };

        // Large changes downgrade a clean step to a warning.
        let status = if status == StepStatus::Success && patch.lines_changed() > LARGE_CHANGE_LINES
        {
            details.insert("large_change".to_string(), "true".to_string());
            StepStatus::Warning
        } else {
            status
        };

        if status != StepStatus::Error {
            lines_changed += patch.lines_changed();
        }

        steps.push(PlanStep {
            index,
            action,
            target: patch.path.clone(),
            status,
            message,
            details,
        });
        index += 1;
    }

    if options.check_conflicts && !cancel.is_cancelled() {
        steps.extend(conflict_steps(patches, &mut index));
    }

    if options.validate_syntax && !cancel.is_cancelled() {
        for (path, content) in &post_images {
            let validation = validate_file(path, content);
            if validation.issue_count() == 0 {
                continue;
            }
            let status = if validation.errors.is_empty() {
                StepStatus::Warning
            } else {
                StepStatus::Error
            };
            let mut details = BTreeMap::new();
            details.insert("errors".to_string(), validation.errors.len().to_string());
            details.insert("warnings".to_string(), validation.warnings.len().to_string());
            steps.push(PlanStep {
                index,
                action: PlanAction::ValidateSyntax,
                target: path.clone(),
                status,
                message: validation
                    .errors
                    .first()
                    .or_else(|| validation.warnings.first())
                    .cloned()
                    .unwrap_or_default(),
                details,
            });
            index += 1;
        }
    }

    if options.estimate_performance && !cancel.is_cancelled() {
        steps.push(PlanStep {
            index,
            action: PlanAction::EstimatePerformance,
            target: "*".to_string(),
            status: StepStatus::Success,
            message: format!("{} lines across {} files", lines_changed, patches.len()),
            details: BTreeMap::new(),
        });
    }

    finish(steps, lines_changed, patches, cancel.is_cancelled())
}

/// Same target mentioned twice, or deleted and modified at once.
fn conflict_steps(patches: &[FilePatch], index: &mut usize) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicated: HashSet<&str> = HashSet::new();
    let deleted: HashSet<&str> = patches
        .iter()
        .filter(|p| p.is_deleted)
        .map(|p| p.path.as_str())
        .collect();

    for patch in patches {
        if !seen.insert(patch.path.as_str()) {
            duplicated.insert(patch.path.as_str());
        }
        if !patch.is_deleted && deleted.contains(patch.path.as_str()) {
            steps.push(PlanStep {
                index: *index,
                action: PlanAction::CheckConflicts,
                target: patch.path.clone(),
                status: StepStatus::Error,
                message: format!("`{}` is both deleted and modified", patch.path),
                details: BTreeMap::new(),
            });
            *index += 1;
        }
    }

    for path in duplicated {
        steps.push(PlanStep {
            index: *index,
            action: PlanAction::CheckConflicts,
            target: path.to_string(),
            status: StepStatus::Error,
            message: format!("`{}` is touched by more than one patch", path),
            details: BTreeMap::new(),
        });
        *index += 1;
    }

    steps
}

fn finish(
    steps: Vec<PlanStep>,
    lines_changed: usize,
    patches: &[FilePatch],
    cancelled: bool,
) -> DryRunPlan {
    let success = !cancelled && steps.iter().all(|s| s.status != StepStatus::Error);
    let files_affected = patches
        .iter()
        .map(|p| p.path.as_str())
        .collect::<HashSet<_>>()
        .len();

    let impact = if lines_changed > LARGE_CHANGE_LINES || patches.iter().any(|p| p.is_deleted) {
        if lines_changed > LARGE_CHANGE_LINES {
            Impact::High
        } else {
            Impact::Medium
        }
    } else if lines_changed > 20 {
        Impact::Medium
    } else {
        Impact::Low
    };

    let rollback_plan = build_rollback_plan(patches);

    DryRunPlan {
        summary: PlanSummary {
            total_steps: steps.len(),
            files_affected,
            lines_changed,
        },
        steps,
        success,
        rollback_plan,
        impact,
        cancelled,
    }
}

/// Reversed sequence of inverse actions, as display text.
fn build_rollback_plan(patches: &[FilePatch]) -> String {
    let mut lines = Vec::new();
    for patch in patches.iter().rev() {
        if patch.is_new {
            lines.push(format!("delete `{}`", patch.path));
        } else if patch.is_deleted {
            lines.push(format!("restore `{}` from backup", patch.path));
        } else {
            lines.push(format!("restore `{}` to its pre-apply content", patch.path));
        }
    }
    lines.push(
        "Recorded backups under the application record directory enable full restoration."
            .to_string(),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{compute_patch, FilePatch, DEFAULT_CONTEXT};
    use tempfile::tempdir;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_empty_patch_set_succeeds_with_zero_steps() {
        let dir = tempdir().unwrap();
        let plan = simulate(
            dir.path(),
            &[],
            DryRunOptions {
                estimate_performance: false,
                ..DryRunOptions::default()
            },
            &token(),
        );
        assert!(plan.success);
        assert!(plan.steps.is_empty());
        assert_eq!(plan.summary.lines_changed, 0);
    }

    #[test]
    fn test_create_requires_absent_target() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("exists.txt"), "content").unwrap();

        let patch = FilePatch::create("exists.txt", "new");
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &token());
        assert!(!plan.success);
        assert!(plan.steps[0].message.contains("already exists"));
    }

    #[test]
    fn test_delete_requires_present_target() {
        let dir = tempdir().unwrap();
        let patch = FilePatch::delete("missing.txt", "old");
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &token());
        assert!(!plan.success);
        assert!(plan.steps[0].message.contains("does not exist"));
    }

    #[test]
    fn test_modify_simulates_application() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc").unwrap();

        let patch = compute_patch("f.txt", "a\nb\nc", "a\nB\nc", DEFAULT_CONTEXT).unwrap();
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &token());
        assert!(plan.success, "steps: {:?}", plan.steps);
        assert_eq!(plan.steps[0].action, PlanAction::Modify);
        // Nothing was written.
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "a\nb\nc");
    }

    #[test]
    fn test_modify_with_stale_patch_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "completely different").unwrap();

        let patch = compute_patch("f.txt", "a\nb\nc", "a\nB\nc", DEFAULT_CONTEXT).unwrap();
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &token());
        assert!(!plan.success);
        assert!(plan.steps[0].message.contains("does not apply"));
    }

    #[test]
    fn test_large_change_downgrades_to_warning() {
        let dir = tempdir().unwrap();
        let big: String = (0..150).map(|i| format!("line {}\n", i)).collect();
        let patch = FilePatch::create("big.txt", &big);
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &token());
        assert!(plan.success);
        assert_eq!(plan.steps[0].status, StepStatus::Warning);
        assert_eq!(plan.impact, Impact::High);
    }

    #[test]
    fn test_conflict_same_target_twice() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc").unwrap();
        let p1 = compute_patch("f.txt", "a\nb\nc", "a\nB\nc", DEFAULT_CONTEXT).unwrap();
        let p2 = compute_patch("f.txt", "a\nb\nc", "a\nb\nC", DEFAULT_CONTEXT).unwrap();

        let plan = simulate(dir.path(), &[p1, p2], DryRunOptions::default(), &token());
        assert!(!plan.success);
        assert!(plan
            .steps
            .iter()
            .any(|s| s.action == PlanAction::CheckConflicts
                && s.message.contains("more than one patch")));
    }

    #[test]
    fn test_conflict_delete_and_modify() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc").unwrap();
        let modify = compute_patch("f.txt", "a\nb\nc", "a\nB\nc", DEFAULT_CONTEXT).unwrap();
        let delete = FilePatch::delete("f.txt", "a\nb\nc");

        let plan = simulate(dir.path(), &[delete, modify], DryRunOptions::default(), &token());
        assert!(plan
            .steps
            .iter()
            .any(|s| s.message.contains("deleted and modified")));
    }

    #[test]
    fn test_syntax_pass_flags_broken_post_image() {
        let dir = tempdir().unwrap();
        let patch = FilePatch::create("bad.json", "{\"a\": 1,}");
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &token());
        assert!(!plan.success);
        assert!(plan
            .steps
            .iter()
            .any(|s| s.action == PlanAction::ValidateSyntax && s.status == StepStatus::Error));
    }

    #[test]
    fn test_cancellation_returns_accumulated_plan() {
        let dir = tempdir().unwrap();
        let cancel = token();
        cancel.cancel();
        let patch = FilePatch::create("a.txt", "x");
        let plan = simulate(dir.path(), &[patch], DryRunOptions::default(), &cancel);
        assert!(plan.cancelled);
        assert!(!plan.success);
    }

    #[test]
    fn test_rollback_plan_reverses_order() {
        let patches = vec![
            FilePatch::create("first.txt", "a"),
            FilePatch::delete("second.txt", "b"),
        ];
        let plan = build_rollback_plan(&patches);
        let restore_pos = plan.find("restore `second.txt`").unwrap();
        let delete_pos = plan.find("delete `first.txt`").unwrap();
        assert!(restore_pos < delete_pos);
        assert!(plan.contains("backups"));
    }
}
