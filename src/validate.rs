//! Syntax and structure checks on proposed post-images
//!
//! Runs a small set of fast, local checks on each file a patch would
//! produce. The goal is catching obviously broken output before it reaches
//! the gate, not exhaustive linting. Dispatch is by file extension.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Findings for one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileValidation {
    pub path: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Human-readable hints for repairing the findings.
    pub fixes: Vec<String>,
}

impl FileValidation {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn issue_count(&self) -> usize {
        self.errors.len() + self.warnings.len()
    }
}

/// Aggregated report over all validated files, worst first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub files: Vec<FileValidation>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.files.iter().any(|f| !f.errors.is_empty())
    }

    pub fn warning_count(&self) -> usize {
        self.files.iter().map(|f| f.warnings.len()).sum()
    }

    pub fn error_summary(&self) -> String {
        self.files
            .iter()
            .flat_map(|f| f.errors.iter().map(move |e| format!("{}: {}", f.path, e)))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate a set of (path, proposed content) pairs.
pub fn validate_files(files: &[(String, String)]) -> ValidationReport {
    let mut report = ValidationReport {
        files: files
            .iter()
            .map(|(path, content)| validate_file(path, content))
            .collect(),
    };
    report.files.sort_by(|a, b| b.issue_count().cmp(&a.issue_count()));
    report
}

/// Validate one file by extension.
pub fn validate_file(path: &str, content: &str) -> FileValidation {
    let mut result = FileValidation::new(path);
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "yml" | "yaml" => check_yaml(path, content, &mut result),
        "json" => check_json(path, content, &mut result),
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => check_typescript(content, &mut result),
        "py" => check_python(content, &mut result),
        "sh" | "bash" => check_shell(content, &mut result),
        _ => {}
    }
    result
}

// ---------------------------------------------------------------------------
// YAML
// ---------------------------------------------------------------------------

fn check_yaml(path: &str, content: &str, result: &mut FileValidation) {
    let parsed: Result<serde_yaml::Value, _> = serde_yaml::from_str(content);
    let doc = match parsed {
        Ok(doc) => Some(doc),
        Err(err) => {
            result.errors.push(format!("YAML does not parse: {}", err));
            result.fixes.push("Fix the YAML syntax error before applying".to_string());
            None
        }
    };

    for (i, line) in content.lines().enumerate() {
        let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
        if indent.contains('\t') {
            result.errors.push(format!("line {}: tab indentation", i + 1));
            result.fixes.push(format!("line {}: replace tabs with spaces", i + 1));
        } else if !indent.is_empty() && indent.len() % 2 != 0 {
            result.warnings.push(format!(
                "line {}: indentation is not a multiple of 2",
                i + 1
            ));
        }
        if line.matches('"').count() % 2 != 0 && !line.trim_start().starts_with('#') {
            result.errors.push(format!("line {}: unmatched double quote", i + 1));
        }
    }

    // Workflow-shaped files additionally need the job/step skeleton.
    let is_workflow = path.contains(".github/workflows")
        || doc
            .as_ref()
            .map(|d| d.get("jobs").is_some())
            .unwrap_or(false);
    if is_workflow {
        if let Some(doc) = doc {
            check_workflow_schema(&doc, result);
        }
    }
}

fn check_workflow_schema(doc: &serde_yaml::Value, result: &mut FileValidation) {
    if doc.get("name").is_none() {
        result.errors.push("workflow is missing top-level `name`".to_string());
        result.fixes.push("Add a `name:` key at the top level".to_string());
    }
    // `on` parses as boolean true under YAML 1.1 loaders; accept both.
    let has_trigger = doc
        .as_mapping()
        .map(|m| {
            m.keys().any(|k| {
                matches!(k, serde_yaml::Value::String(s) if s == "on")
                    || matches!(k, serde_yaml::Value::Bool(true))
            })
        })
        .unwrap_or(false);
    if !has_trigger {
        result.errors.push("workflow is missing a trigger clause".to_string());
        result.fixes.push("Add an `on:` clause (push, pull_request, ...)".to_string());
    }

    let Some(jobs) = doc.get("jobs").and_then(|j| j.as_mapping()) else {
        result.errors.push("workflow is missing a `jobs` mapping".to_string());
        result.fixes.push("Add a `jobs:` mapping with at least one job".to_string());
        return;
    };

    for (job_name, job) in jobs {
        let job_name = job_name.as_str().unwrap_or("<job>");
        if job.get("runs-on").is_none() {
            result.errors.push(format!("job `{}` has no runner declaration", job_name));
            result.fixes.push(format!("Add `runs-on:` to job `{}`", job_name));
        }
        let steps = job.get("steps").and_then(|s| s.as_sequence());
        match steps {
            None => {
                result.errors.push(format!("job `{}` has no steps", job_name));
                result.fixes.push(format!("Add at least one step to job `{}`", job_name));
            }
            Some(steps) if steps.is_empty() => {
                result.errors.push(format!("job `{}` has no steps", job_name));
                result.fixes.push(format!("Add at least one step to job `{}`", job_name));
            }
            Some(steps) => {
                for (i, step) in steps.iter().enumerate() {
                    if step.get("uses").is_none() && step.get("run").is_none() {
                        result.errors.push(format!(
                            "job `{}` step {} has neither `uses` nor `run`",
                            job_name, i
                        ));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*[}\]]").expect("trailing comma pattern"));

fn check_json(path: &str, content: &str, result: &mut FileValidation) {
    // Trailing commas are reported explicitly even though the parser
    // rejects them too; the fix hint is more useful than a parse offset.
    if TRAILING_COMMA.is_match(content) {
        result.errors.push("trailing comma before a closing bracket".to_string());
        result.fixes.push("Remove the comma before `}` or `]`".to_string());
    }

    let parsed: Result<serde_json::Value, _> = serde_json::from_str(content);
    match parsed {
        Ok(doc) => {
            let is_manifest = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n == "package.json")
                .unwrap_or(false);
            if is_manifest {
                for field in ["name", "version"] {
                    if doc.get(field).is_none() {
                        result.errors.push(format!("package manifest is missing `{}`", field));
                        result.fixes.push(format!("Add a `{}` field", field));
                    }
                }
            }
        }
        Err(err) => {
            if result.errors.is_empty() {
                result.errors.push(format!("JSON does not parse: {}", err));
                result.fixes.push("Fix the JSON syntax error before applying".to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TypeScript / JavaScript
// ---------------------------------------------------------------------------

fn check_typescript(content: &str, result: &mut FileValidation) {
    let (braces, parens) = bracket_balance(content);
    if braces != 0 {
        result.errors.push(format!("unbalanced braces ({:+})", braces));
        result.fixes.push("Match every `{` with a `}`".to_string());
    }
    if parens != 0 {
        result.errors.push(format!("unbalanced parentheses ({:+})", parens));
        result.fixes.push("Match every `(` with a `)`".to_string());
    }

    for (i, line) in content.lines().enumerate() {
        if line.contains("@ts-ignore") || line.contains("@ts-nocheck") {
            result.warnings.push(format!("line {}: type checking suppressed", i + 1));
        }
        if line.contains(": any") || line.contains("as any") {
            result.warnings.push(format!("line {}: `any` escapes the type system", i + 1));
        }
        if line.trim_start().starts_with("var ") {
            result.warnings.push(format!("line {}: `var` declaration", i + 1));
            result.fixes.push(format!("line {}: use `const` or `let`", i + 1));
        }
    }
}

/// Net brace/paren balance, skipping string and comment contents naively.
fn bracket_balance(content: &str) -> (i64, i64) {
    let mut braces = 0i64;
    let mut parens = 0i64;
    let mut in_string: Option<char> = None;
    let mut prev = '\0';

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") || trimmed.starts_with('*') {
            continue;
        }
        for c in line.chars() {
            match in_string {
                Some(quote) => {
                    if c == quote && prev != '\\' {
                        in_string = None;
                    }
                }
                None => match c {
                    '"' | '\'' | '`' => in_string = Some(c),
                    '{' => braces += 1,
                    '}' => braces -= 1,
                    '(' => parens += 1,
                    ')' => parens -= 1,
                    _ => {}
                },
            }
            prev = c;
        }
        // Strings do not span lines in this rough model (template literals
        // excepted, which we accept as a known false-negative source).
        if in_string != Some('`') {
            in_string = None;
        }
    }
    (braces, parens)
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

const PY_BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "for", "while", "with", "try", "except", "finally", "else",
];

fn check_python(content: &str, result: &mut FileValidation) {
    for (i, line) in content.lines().enumerate() {
        let indent = line.chars().take_while(|c| *c == ' ').count();
        if indent % 4 != 0 && !line.trim().is_empty() {
            result.warnings.push(format!(
                "line {}: indentation is not a multiple of 4",
                i + 1
            ));
        }

        let trimmed = line.trim();
        let code = trimmed.split('#').next().unwrap_or("").trim_end();
        if code.is_empty() {
            continue;
        }
        let first_word = code
            .split([' ', ':', '('])
            .next()
            .unwrap_or("");
        let opens_block = PY_BLOCK_KEYWORDS.contains(&first_word);
        if opens_block && !code.ends_with(':') && !code.ends_with('\\') && !code.contains('(') {
            result.warnings.push(format!("line {}: block statement without a colon", i + 1));
            result.fixes.push(format!("line {}: add a trailing `:`", i + 1));
        }
    }
}

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

static UNQUOTED_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:^|[^"'\\])\$\{?[A-Za-z_][A-Za-z0-9_]*"#).expect("var pattern"));

fn check_shell(content: &str, result: &mut FileValidation) {
    if !content.starts_with("#!") {
        result.warnings.push("no shebang line".to_string());
        result.fixes.push("Start the script with `#!/usr/bin/env bash`".to_string());
    }

    for (i, line) in content.lines().enumerate() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        if UNQUOTED_VAR.is_match(line) && !line.contains("\"$") {
            result.warnings.push(format!("line {}: unquoted variable reference", i + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_WORKFLOW: &str = r#"name: ci
on:
  push:
    branches: [main]
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - run: npm test
"#;

    #[test]
    fn test_valid_workflow_passes() {
        let result = validate_file(".github/workflows/ci.yml", GOOD_WORKFLOW);
        assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_workflow_missing_name_and_trigger() {
        let yaml = "jobs:\n  test:\n    runs-on: ubuntu-latest\n    steps:\n      - run: ls\n";
        let result = validate_file("ci.yml", yaml);
        assert!(result.errors.iter().any(|e| e.contains("`name`")));
        assert!(result.errors.iter().any(|e| e.contains("trigger")));
    }

    #[test]
    fn test_workflow_job_without_runner_or_steps() {
        let yaml = "name: x\non: push\njobs:\n  broken: {}\n";
        let result = validate_file("ci.yml", yaml);
        assert!(result.errors.iter().any(|e| e.contains("no runner")));
        assert!(result.errors.iter().any(|e| e.contains("no steps")));
    }

    #[test]
    fn test_workflow_step_without_uses_or_run() {
        let yaml = "name: x\non: push\njobs:\n  j:\n    runs-on: ubuntu-latest\n    steps:\n      - name: floating\n";
        let result = validate_file("ci.yml", yaml);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("neither `uses` nor `run`")));
    }

    #[test]
    fn test_yaml_tab_indentation_is_error() {
        let yaml = "name: x\non: push\njobs:\n\ttest:\n\t\truns-on: ubuntu-latest\n";
        let result = validate_file("ci.yml", yaml);
        assert!(result.errors.iter().any(|e| e.contains("tab indentation")));
    }

    #[test]
    fn test_json_trailing_comma() {
        let result = validate_file("config.json", "{\"a\": 1,}");
        assert!(result.errors.iter().any(|e| e.contains("trailing comma")));
    }

    #[test]
    fn test_package_manifest_requires_name_and_version() {
        let result = validate_file("package.json", "{\"scripts\": {}}");
        assert!(result.errors.iter().any(|e| e.contains("`name`")));
        assert!(result.errors.iter().any(|e| e.contains("`version`")));

        let ok = validate_file("package.json", r#"{"name": "app", "version": "1.0.0"}"#);
        assert!(ok.errors.is_empty());
    }

    #[test]
    fn test_typescript_unbalanced_braces() {
        let result = validate_file("app.ts", "function f() { if (x) { return 1; }\n");
        assert!(result.errors.iter().any(|e| e.contains("unbalanced braces")));
    }

    #[test]
    fn test_typescript_braces_in_strings_ignored() {
        let result = validate_file("app.ts", "const s = \"{ not a brace\";\nconst f = () => 1;\n");
        assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_typescript_any_warning() {
        let result = validate_file("app.ts", "const x: any = load();\n");
        assert!(result.warnings.iter().any(|w| w.contains("any")));
    }

    #[test]
    fn test_python_indentation_warning() {
        let result = validate_file("run.py", "def f():\n   return 1\n");
        assert!(result.warnings.iter().any(|w| w.contains("multiple of 4")));
    }

    #[test]
    fn test_python_missing_colon() {
        let result = validate_file("run.py", "if x > 1\n    pass\n");
        assert!(result.warnings.iter().any(|w| w.contains("colon")));
    }

    #[test]
    fn test_shell_shebang_and_quoting() {
        let result = validate_file("deploy.sh", "rm -rf $TARGET\n");
        assert!(result.warnings.iter().any(|w| w.contains("shebang")));
        assert!(result.warnings.iter().any(|w| w.contains("unquoted variable")));

        let ok = validate_file("deploy.sh", "#!/usr/bin/env bash\nrm -rf \"$TARGET\"\n");
        assert!(ok.warnings.is_empty(), "warnings: {:?}", ok.warnings);
    }

    #[test]
    fn test_unknown_extension_is_clean() {
        let result = validate_file("README.md", "# anything goes");
        assert_eq!(result.issue_count(), 0);
    }

    #[test]
    fn test_report_sorted_by_issue_count() {
        let report = validate_files(&[
            ("ok.json".to_string(), "{}".to_string()),
            ("bad.json".to_string(), "{\"a\": 1,}".to_string()),
        ]);
        assert_eq!(report.files[0].path, "bad.json");
        assert!(report.has_errors());
    }
}
