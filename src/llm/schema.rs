//! Agent response contracts and schema validation
//!
//! Expert responses arrive as untyped text. Each role declares a wire
//! contract here; validation reports path-qualified violations that the
//! retry orchestrator feeds back to the model as a correction directive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four expert roles, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    LogAnalyst,
    WorkflowExpert,
    CodeReviewer,
    FixGenerator,
}

impl AgentKind {
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::LogAnalyst => "log_analyst",
            AgentKind::WorkflowExpert => "workflow_expert",
            AgentKind::CodeReviewer => "code_reviewer",
            AgentKind::FixGenerator => "fix_generator",
        }
    }

    /// Validate a parsed response against this role's wire contract.
    pub fn validate(&self, value: &Value) -> Vec<String> {
        match self {
            AgentKind::LogAnalyst => validate_log_analyst(value),
            AgentKind::WorkflowExpert => validate_workflow_expert(value),
            AgentKind::CodeReviewer => validate_code_reviewer(value),
            AgentKind::FixGenerator => validate_fix_generator(value),
        }
    }
}

/// Log Analyst wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogAnalystReport {
    pub failure_type: String,
    pub severity: String,
    pub summary: String,
    #[serde(default)]
    pub root_cause_lines: Vec<String>,
    #[serde(default)]
    pub context_lines: Vec<String>,
    #[serde(default)]
    pub suggested_search_terms: Vec<String>,
}

/// One proposed workflow-file change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlChange {
    pub path: String,
    #[serde(default)]
    pub old_value: String,
    pub new_value: String,
    #[serde(default)]
    pub reason: String,
}

/// Workflow Expert wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    pub issue_type: String,
    pub recommendation: String,
    #[serde(default)]
    pub yaml_changes: Vec<YamlChange>,
    pub risk_level: String,
}

/// One issue flagged by the Code Reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: String,
    pub file: String,
    #[serde(default)]
    pub line: u64,
    pub message: String,
    #[serde(default)]
    pub suggestion: String,
}

/// Code Reviewer wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewReport {
    #[serde(default)]
    pub issues_found: Vec<ReviewIssue>,
    pub overall_score: u64,
    #[serde(default)]
    pub blockers: Vec<String>,
}

/// Fix Generator wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixReport {
    pub confidence: f64,
    pub fix_file: String,
    pub fix_start_line: u64,
    pub fix_content: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_steps: Option<String>,
}

// ---------------------------------------------------------------------------
// Field-level validators
// ---------------------------------------------------------------------------

fn require_str(value: &Value, path: &str, violations: &mut Vec<String>) -> Option<String> {
    match value.get(path) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            violations.push(format!("{}: expected a string", path));
            None
        }
        None => {
            violations.push(format!("{}: missing required field", path));
            None
        }
    }
}

fn require_str_enum(
    value: &Value,
    path: &str,
    allowed: &[&str],
    violations: &mut Vec<String>,
) {
    if let Some(s) = require_str(value, path, violations) {
        if !allowed.contains(&s.as_str()) {
            violations.push(format!(
                "{}: expected one of {}, got `{}`",
                path,
                allowed.join("|"),
                s
            ));
        }
    }
}

fn check_str_len(value: &Value, path: &str, max: usize, violations: &mut Vec<String>) {
    if let Some(Value::String(s)) = value.get(path) {
        if s.chars().count() > max {
            violations.push(format!("{}: longer than {} characters", path, max));
        }
    }
}

fn check_array_len(value: &Value, path: &str, max: usize, violations: &mut Vec<String>) {
    match value.get(path) {
        Some(Value::Array(items)) if items.len() > max => {
            violations.push(format!("{}: more than {} entries", path, max));
        }
        Some(Value::Array(_)) | None => {}
        Some(_) => violations.push(format!("{}: expected an array", path)),
    }
}

fn require_number_range(
    value: &Value,
    path: &str,
    min: f64,
    max: f64,
    violations: &mut Vec<String>,
) {
    match value.get(path).and_then(Value::as_f64) {
        Some(n) if n >= min && n <= max => {}
        Some(n) => violations.push(format!("{}: {} outside [{}, {}]", path, n, min, max)),
        None => violations.push(format!("{}: missing required number", path)),
    }
}

fn validate_log_analyst(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    require_str_enum(
        value,
        "failureType",
        &["auth", "build", "test", "deploy", "network", "timeout", "env", "unknown"],
        &mut violations,
    );
    require_str_enum(
        value,
        "severity",
        &["critical", "high", "medium", "low"],
        &mut violations,
    );
    require_str(value, "summary", &mut violations);
    check_str_len(value, "summary", 200, &mut violations);
    check_array_len(value, "contextLines", 5, &mut violations);
    check_array_len(value, "suggestedSearchTerms", 3, &mut violations);
    violations
}

fn validate_workflow_expert(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    require_str_enum(
        value,
        "issueType",
        &["permissions", "secrets", "env-vars", "matrix", "cache", "concurrency", "none"],
        &mut violations,
    );
    require_str(value, "recommendation", &mut violations);
    check_str_len(value, "recommendation", 300, &mut violations);
    require_str_enum(value, "riskLevel", &["low", "medium", "high"], &mut violations);
    if let Some(Value::Array(changes)) = value.get("yamlChanges") {
        for (i, change) in changes.iter().enumerate() {
            for field in ["path", "newValue"] {
                if change.get(field).and_then(Value::as_str).is_none() {
                    violations.push(format!("yamlChanges[{}].{}: missing required field", i, field));
                }
            }
        }
    }
    violations
}

fn validate_code_reviewer(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    require_number_range(value, "overallScore", 0.0, 100.0, &mut violations);
    if let Some(Value::Array(issues)) = value.get("issuesFound") {
        for (i, issue) in issues.iter().enumerate() {
            if let Some(kind) = issue.get("type").and_then(Value::as_str) {
                if !["security", "performance", "style", "logic", "testing"].contains(&kind) {
                    violations.push(format!("issuesFound[{}].type: unknown kind `{}`", i, kind));
                }
            } else {
                violations.push(format!("issuesFound[{}].type: missing required field", i));
            }
            if let Some(severity) = issue.get("severity").and_then(Value::as_str) {
                if !["critical", "major", "minor"].contains(&severity) {
                    violations.push(format!(
                        "issuesFound[{}].severity: unknown severity `{}`",
                        i, severity
                    ));
                }
            } else {
                violations.push(format!("issuesFound[{}].severity: missing required field", i));
            }
            if issue.get("file").and_then(Value::as_str).is_none() {
                violations.push(format!("issuesFound[{}].file: missing required field", i));
            }
            if issue.get("message").and_then(Value::as_str).is_none() {
                violations.push(format!("issuesFound[{}].message: missing required field", i));
            }
        }
    }
    violations
}

fn validate_fix_generator(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    require_number_range(value, "confidence", 0.0, 1.0, &mut violations);
    require_str(value, "fixFile", &mut violations);
    match value.get("fixStartLine").and_then(Value::as_u64) {
        Some(_) => {}
        None => violations.push("fixStartLine: missing required integer".to_string()),
    }
    require_str(value, "fixContent", &mut violations);
    require_str(value, "explanation", &mut violations);
    check_str_len(value, "explanation", 500, &mut violations);
    violations
}
