//! Configuration management for forgefix
//!
//! Settings are merged from a layered hierarchy, first layer that defines a
//! key wins: an explicit path, `~/.forge/config.json`, `<cwd>/.forge.json`,
//! `<cwd>/.github/forge-config.json`, then built-in defaults. A handful of
//! environment variables override the merged result.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Fully resolved configuration, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Score at or above which a fix may be applied without review.
    pub auto_apply_threshold: f64,
    /// Score at or above which a fix goes to manual review.
    pub manual_review_threshold: f64,
    /// Score at or above which a fix is escalated rather than rejected.
    pub escalate_threshold: f64,
    /// Allow auto-apply even when the primary failure is critical.
    pub allow_auto_apply_on_critical: bool,
    /// Route security-sensitive paths to manual review.
    pub requires_security_review: bool,
    /// Route performance-sensitive paths to manual review.
    pub requires_performance_review: bool,
    /// Lines kept from the top of an oversized log.
    pub prune_head_lines: usize,
    /// Lines kept from the bottom of an oversized log.
    pub prune_tail_lines: usize,
    /// Maximum backend attempts per agent call.
    pub max_retries: u32,
    /// Per-attempt backend timeout in seconds.
    pub request_timeout_secs: u64,
    /// Sampling temperature for backend calls.
    pub temperature: f64,
    /// Run the dry-run simulator before applying.
    pub dry_run_before_apply: bool,
    /// Directory for the audit journal (defaults to `~/.forge`).
    pub log_dir: Option<PathBuf>,
    /// Also mask low-severity categories (emails, session ids).
    pub aggressive_redaction: bool,
    /// Skip the backend entirely; classification and validation only.
    pub local_only: bool,
    /// Override for the per-model token cap.
    pub token_budget: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_apply_threshold: 0.9,
            manual_review_threshold: 0.6,
            escalate_threshold: 0.3,
            allow_auto_apply_on_critical: false,
            requires_security_review: true,
            requires_performance_review: false,
            prune_head_lines: 100,
            prune_tail_lines: 500,
            max_retries: 3,
            request_timeout_secs: 30,
            temperature: 0.3,
            dry_run_before_apply: true,
            log_dir: None,
            aggressive_redaction: false,
            local_only: false,
            token_budget: None,
        }
    }
}

/// A single layer of the hierarchy. Absent keys fall through to the next.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    auto_apply_threshold: Option<f64>,
    manual_review_threshold: Option<f64>,
    escalate_threshold: Option<f64>,
    allow_auto_apply_on_critical: Option<bool>,
    requires_security_review: Option<bool>,
    requires_performance_review: Option<bool>,
    prune_head_lines: Option<usize>,
    prune_tail_lines: Option<usize>,
    max_retries: Option<u32>,
    request_timeout_secs: Option<u64>,
    temperature: Option<f64>,
    dry_run_before_apply: Option<bool>,
    log_dir: Option<PathBuf>,
    aggressive_redaction: Option<bool>,
    local_only: Option<bool>,
    token_budget: Option<usize>,
}

macro_rules! merge_layers {
    ($config:expr, $layers:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if let Some(value) = $layers.iter().find_map(|l| l.$field.clone()) {
                $config.$field = value;
            }
        )+
    };
}

impl Config {
    /// Candidate config paths in precedence order.
    fn layer_paths(explicit: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(p) = explicit {
            paths.push(p.to_path_buf());
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".forge").join("config.json"));
        }
        paths.push(cwd.join(".forge.json"));
        paths.push(cwd.join(".github").join("forge-config.json"));
        paths
    }

    /// Load and merge the hierarchy rooted at `cwd`, then apply environment
    /// overrides.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Self {
        let mut layers = Vec::new();
        for path in Self::layer_paths(explicit, cwd) {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str::<ConfigLayer>(&content) {
                    Ok(layer) => layers.push(layer),
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: config {} was corrupted ({}). A backup was saved and the layer was skipped.",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }

        let mut config = Config::default();
        merge_layers!(
            config,
            layers,
            [
                auto_apply_threshold,
                manual_review_threshold,
                escalate_threshold,
                allow_auto_apply_on_critical,
                requires_security_review,
                requires_performance_review,
                prune_head_lines,
                prune_tail_lines,
                max_retries,
                request_timeout_secs,
                temperature,
                dry_run_before_apply,
                aggressive_redaction,
                local_only,
            ]
        );
        if let Some(v) = layers.iter().find_map(|l| l.log_dir.clone()) {
            config.log_dir = Some(v);
        }
        if let Some(v) = layers.iter().find_map(|l| l.token_budget) {
            config.token_budget = Some(v);
        }
        config.apply_env_overrides();
        config
    }

    /// Environment overrides, applied after the file hierarchy.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FORGE_LOG_DIR") {
            if !dir.is_empty() {
                self.log_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(v) = std::env::var("FORGE_AGGRESSIVE_REDACTION") {
            self.aggressive_redaction = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("FORGE_LOCAL_ONLY") {
            self.local_only = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("FORGE_TOKEN_BUDGET") {
            if let Ok(cap) = v.parse::<usize>() {
                self.token_budget = Some(cap);
            }
        }
    }

    /// Resolved journal directory.
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".forge")
        })
    }
}

/// Keep a copy of an unparseable config instead of silently discarding it.
fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
