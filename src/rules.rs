//! Rule-driven failure classification
//!
//! Scans a pruned log line by line against an ordered catalogue of
//! patterns. The first rule that matches a line wins for that line; the
//! catalogue order is therefore behaviour-bearing and is kept specific to
//! generic, with the catch-all rule last.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many preceding lines are scanned for a step delimiter.
const STEP_SCAN_WINDOW: usize = 20;
/// Stack-trace window around a match.
const TRACE_BEFORE: usize = 5;
const TRACE_AFTER: usize = 15;

/// Broad category of a CI failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Auth,
    Build,
    Test,
    Lint,
    Deploy,
    Network,
    Timeout,
    Env,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Auth => "auth",
            FailureType::Build => "build",
            FailureType::Test => "test",
            FailureType::Lint => "lint",
            FailureType::Deploy => "deploy",
            FailureType::Network => "network",
            FailureType::Timeout => "timeout",
            FailureType::Env => "env",
            FailureType::Unknown => "unknown",
        }
    }
}

/// Severity attached to a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One classified failure occurrence in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub failure_type: FailureType,
    pub severity: Severity,
    /// Trimmed single line that triggered the rule.
    pub message: String,
    /// 1-based line number in the pruned log.
    pub line_number: usize,
    /// Workflow step the line belongs to, or `unknown`.
    pub step: String,
    pub context: BTreeMap<String, String>,
    pub stack_trace: Option<String>,
    /// Confidence modifier of the rule that fired.
    pub rule_confidence: f64,
    /// Identifier of the rule that fired.
    pub rule_id: String,
}

type ContextExtractor = fn(&Captures) -> BTreeMap<String, String>;

/// One entry in the classification catalogue.
pub struct Rule {
    pub id: &'static str,
    pub name: &'static str,
    pattern: Regex,
    pub failure_type: FailureType,
    pub severity: Severity,
    pub confidence_modifier: f64,
    context_extractor: Option<ContextExtractor>,
}

fn rule(
    id: &'static str,
    name: &'static str,
    pattern: &str,
    failure_type: FailureType,
    severity: Severity,
    confidence_modifier: f64,
    context_extractor: Option<ContextExtractor>,
) -> Rule {
    Rule {
        id,
        name,
        pattern: Regex::new(pattern).expect("rule pattern must compile"),
        failure_type,
        severity,
        confidence_modifier,
        context_extractor,
    }
}

fn registry_context(caps: &Captures) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(url) = caps.name("url") {
        map.insert("registry".to_string(), url.as_str().to_string());
    }
    map.insert("errorCode".to_string(), "E403".to_string());
    map
}

fn secret_context(caps: &Captures) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(name) = caps.name("secret") {
        map.insert("secretName".to_string(), name.as_str().to_string());
    }
    map
}

fn node_version_context(caps: &Captures) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(version) = caps.name("version") {
        map.insert("nodeVersion".to_string(), version.as_str().to_string());
    }
    map.insert("api".to_string(), "crypto.subtle".to_string());
    map
}

fn exit_code_context(caps: &Captures) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(code) = caps.name("code") {
        map.insert("exitCode".to_string(), code.as_str().to_string());
    }
    map
}

// Catalogue order is load-bearing: registry/container/secret rules must win
// over the generic auth and build rules, and the catch-all stays last.
static CATALOG: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(
            "npm-registry-forbidden",
            "npm registry publish forbidden",
            r"npm ERR!.*E403|403 Forbidden - PUT (?P<url>\S+)",
            FailureType::Auth,
            Severity::Critical,
            0.95,
            Some(registry_context),
        ),
        rule(
            "container-registry-denied",
            "container registry push denied",
            r"denied: denied|unauthorized: authentication required",
            FailureType::Auth,
            Severity::Critical,
            0.95,
            None,
        ),
        rule(
            "secret-not-defined",
            "referenced secret is not defined",
            r"[Ss]ecret '(?P<secret>[^']+)' is not defined",
            FailureType::Env,
            Severity::Error,
            0.92,
            Some(secret_context),
        ),
        rule(
            "node-runtime-api-missing",
            "runtime API missing on end-of-life Node",
            r"crypto\.subtle is not available in Node (?P<version>\d+)",
            FailureType::Build,
            Severity::Error,
            0.88,
            Some(node_version_context),
        ),
        rule(
            "auth-generic",
            "authentication or authorization failure",
            r"(?i)authentication failed|invalid credentials|permission denied|401 Unauthorized|403 Forbidden",
            FailureType::Auth,
            Severity::Error,
            0.85,
            None,
        ),
        rule(
            "module-not-found",
            "missing module or dependency",
            r"(?i)cannot find module|module not found|unresolved import",
            FailureType::Build,
            Severity::Error,
            0.85,
            None,
        ),
        rule(
            "compile-error",
            "compiler reported an error",
            r"(?i)compilation failed|error TS\d+|error\[E\d+\]|undefined reference|syntax ?error",
            FailureType::Build,
            Severity::Error,
            0.85,
            None,
        ),
        rule(
            "test-failure",
            "test suite failure",
            r"(?i)\d+ (failing|failed)|tests? failed|assertion failed|AssertionError|FAIL(ED)? ",
            FailureType::Test,
            Severity::Error,
            0.80,
            None,
        ),
        rule(
            "deploy-failure",
            "deployment failure",
            r"(?i)deploy(ment)? failed|rollout (failed|aborted)|release failed",
            FailureType::Deploy,
            Severity::Critical,
            0.85,
            None,
        ),
        rule(
            "oom-kill",
            "process killed by the runner",
            r"(?i)out of memory|OOMKilled|exit code (?P<code>137)",
            FailureType::Env,
            Severity::Critical,
            0.80,
            Some(exit_code_context),
        ),
        rule(
            "network-error",
            "network connectivity error",
            r"(?i)ECONNREFUSED|ETIMEDOUT|ENOTFOUND|getaddrinfo|connection (refused|reset)|network unreachable",
            FailureType::Network,
            Severity::Error,
            0.75,
            None,
        ),
        rule(
            "timeout",
            "operation exceeded its time limit",
            r"(?i)timed? ?out|exceeded .*time limit|deadline exceeded",
            FailureType::Timeout,
            Severity::Error,
            0.75,
            None,
        ),
        rule(
            "env-var-missing",
            "environment variable missing",
            r"(?i)environment variable \S+ (is )?(not set|missing|undefined)|\S+ is not set",
            FailureType::Env,
            Severity::Error,
            0.80,
            None,
        ),
        rule(
            "lint-error",
            "linter findings",
            r"(?i)eslint|\blint(ing)? (error|failed)|clippy::",
            FailureType::Lint,
            Severity::Warning,
            0.70,
            None,
        ),
        rule(
            "uncaught-exception",
            "uncaught runtime exception",
            r"\b[A-Z][A-Za-z]*(?:Error|Exception)\b:",
            FailureType::Unknown,
            Severity::Error,
            0.65,
            None,
        ),
        // Catch-all. The scorer treats this as the fallback signal (0.5).
        rule(
            "generic-error",
            "unclassified error line",
            r"(?i)\bfatal\b|\berror\b|\bfailed\b",
            FailureType::Unknown,
            Severity::Error,
            0.5,
            None,
        ),
    ]
});

/// Expose the catalogue for documentation and tests.
pub fn rule_catalog() -> &'static [Rule] {
    &CATALOG
}

/// Classify every line of the pruned log.
///
/// Returns events in order of appearance. An empty result means no rule
/// matched anywhere; callers must treat that as fatal to the run.
pub fn classify(log_text: &str) -> Vec<FailureEvent> {
    let lines: Vec<&str> = log_text.lines().collect();
    let mut events = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let Some((matched, caps)) = first_match(line) else {
            continue;
        };

        let context = matched
            .context_extractor
            .map(|extract| extract(&caps))
            .unwrap_or_default();

        events.push(FailureEvent {
            failure_type: matched.failure_type,
            severity: matched.severity,
            message: line.trim().to_string(),
            line_number: idx + 1,
            step: resolve_step(&lines, idx),
            context,
            stack_trace: capture_stack_trace(&lines, idx),
            rule_confidence: matched.confidence_modifier,
            rule_id: matched.id.to_string(),
        });
    }

    events
}

fn first_match<'a>(line: &'a str) -> Option<(&'static Rule, Captures<'a>)> {
    for rule in CATALOG.iter() {
        if let Some(caps) = rule.pattern.captures(line) {
            return Some((rule, caps));
        }
    }
    None
}

static STEP_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^##\[group\]Run (.+)$").expect("step pattern"));
static STEP_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^##\[[a-z]+\](.+)$").expect("step pattern"));
static STEP_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[([^\[\]]{1,60})\]\s*$").expect("step pattern"));
static STEP_COLON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9 _./-]{0,48}):\s*$").expect("step pattern"));

/// Scan up to `STEP_SCAN_WINDOW` preceding lines for a step delimiter.
fn resolve_step(lines: &[&str], idx: usize) -> String {
    let start = idx.saturating_sub(STEP_SCAN_WINDOW);
    for line in lines[start..=idx].iter().rev() {
        if let Some(caps) = STEP_GROUP.captures(line) {
            return caps[1].trim().to_string();
        }
        if let Some(caps) = STEP_ITEM.captures(line) {
            return caps[1].trim().to_string();
        }
        if let Some(caps) = STEP_BRACKET.captures(line) {
            return caps[1].trim().to_string();
        }
        if let Some(caps) = STEP_COLON.captures(line) {
            return caps[1].trim().to_string();
        }
    }
    "unknown".to_string()
}

/// Attach the surrounding window when it resembles a stack trace.
fn capture_stack_trace(lines: &[&str], idx: usize) -> Option<String> {
    let start = idx.saturating_sub(TRACE_BEFORE);
    let end = (idx + TRACE_AFTER).min(lines.len().saturating_sub(1));
    let window = &lines[start..=end];

    let trace_lines = window
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("at ") || l.contains("Error:") || l.to_lowercase().contains("stack")
        })
        .count();

    if trace_lines >= 2 {
        Some(window.join("\n"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npm_registry_rule_wins_over_generic_auth() {
        let log = "npm ERR! code E403\n403 Forbidden - PUT https://registry.npmjs.org/pkg";
        let events = classify(log);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].failure_type, FailureType::Auth);
        assert_eq!(events[0].rule_id, "npm-registry-forbidden");
        assert_eq!(events[1].context.get("registry").unwrap(), "https://registry.npmjs.org/pkg");
    }

    #[test]
    fn test_container_denied() {
        let events = classify("unauthorized: authentication required");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].failure_type, FailureType::Auth);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn test_secret_not_defined_extracts_name() {
        let events = classify("Error: secret 'stage.prod.DB_PASS' is not defined");
        assert_eq!(events[0].failure_type, FailureType::Env);
        assert_eq!(events[0].context.get("secretName").unwrap(), "stage.prod.DB_PASS");
    }

    #[test]
    fn test_node_eol_rule() {
        let events = classify("ReferenceError: crypto.subtle is not available in Node 14");
        assert_eq!(events[0].failure_type, FailureType::Build);
        assert_eq!(events[0].context.get("nodeVersion").unwrap(), "14");
    }

    #[test]
    fn test_step_resolution_group() {
        let log = "##[group]Run npm publish\nnpm notice\nnpm ERR! code E403";
        let events = classify(log);
        assert_eq!(events[0].step, "npm publish");
    }

    #[test]
    fn test_step_resolution_bracket_and_colon() {
        let log = "[deploy]\nrollout failed for api";
        let events = classify(log);
        assert_eq!(events[0].step, "deploy");

        let log = "Install dependencies:\nError: cannot find module 'left-pad'";
        let events = classify(log);
        assert_eq!(events[0].step, "Install dependencies");
    }

    #[test]
    fn test_step_unknown_when_out_of_window() {
        let mut lines = vec!["##[group]Run setup".to_string()];
        for _ in 0..25 {
            lines.push("noise".to_string());
        }
        lines.push("build failed with errors".to_string());
        let events = classify(&lines.join("\n"));
        assert_eq!(events[0].step, "unknown");
    }

    #[test]
    fn test_stack_trace_attached() {
        let log = "TypeError: Cannot read properties of undefined\n    at Object.run (/app/index.js:10:5)\n    at main (/app/index.js:20:3)";
        let events = classify(log);
        assert!(events[0].stack_trace.is_some());
        assert!(events[0].stack_trace.as_ref().unwrap().contains("at Object.run"));
    }

    #[test]
    fn test_no_trace_for_isolated_error() {
        let events = classify("plain failed line with nothing around");
        assert!(events[0].stack_trace.is_none());
    }

    #[test]
    fn test_clean_log_yields_no_events() {
        let events = classify("everything passed\nall green\ndone");
        assert!(events.is_empty());
    }

    #[test]
    fn test_first_rule_wins_per_line() {
        // Line matches both the timeout and generic rules; timeout is earlier.
        let events = classify("request timed out after 30s and failed");
        assert_eq!(events[0].failure_type, FailureType::Timeout);
    }

    #[test]
    fn test_catalog_ends_with_catch_all() {
        let last = rule_catalog().last().unwrap();
        assert_eq!(last.id, "generic-error");
        assert_eq!(last.confidence_modifier, 0.5);
    }
}
