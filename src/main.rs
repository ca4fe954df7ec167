//! forgefix - CI failure diagnosis and guarded auto-fix
//!
//! Reads a failed CI log, classifies the failure, runs the expert pipeline
//! against the configured backend, and either applies the generated fix
//! with rollback support or hands it to review.

use anyhow::{Context, Result};
use clap::Parser;
use forgefix::apply::Applicator;
use forgefix::audit::{AuditEntry, AuditEvent, AuditJournal, AuditStatus};
use forgefix::config::Config;
use forgefix::error::ForgeError;
use forgefix::gate::GateAction;
use forgefix::llm::OpenRouterBackend;
use forgefix::pipeline::{Pipeline, PipelineOptions, PipelineOutcome};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "forgefix",
    about = "Diagnose failed CI runs and produce reviewable, auto-applicable fixes",
    version
)]
struct Args {
    /// CI log file to diagnose
    #[arg(long)]
    log: Option<PathBuf>,

    /// Workflow configuration file for the failing run
    #[arg(long)]
    workflow: Option<PathBuf>,

    /// Unified diff of the change set that triggered the run
    #[arg(long)]
    diff: Option<PathBuf>,

    /// Working tree root (defaults to the current directory)
    #[arg(long, default_value = ".")]
    path: PathBuf,

    /// Explicit config file (first layer of the hierarchy)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Apply the fix when the gate allows it
    #[arg(long)]
    apply: bool,

    /// Classification and validation only; never call the backend
    #[arg(long)]
    local: bool,

    /// Backend to use for the expert pipeline
    #[arg(long, default_value = "openrouter")]
    backend: String,

    /// Backend API key (overrides OPENROUTER_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Mask low-severity categories (emails, session ids) too
    #[arg(long)]
    aggressive_redaction: bool,

    /// Directory for the audit journal
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Auto-apply confidence threshold
    #[arg(long)]
    auto_threshold: Option<f64>,

    /// Manual-review confidence threshold
    #[arg(long)]
    review_threshold: Option<f64>,

    /// Escalation confidence threshold
    #[arg(long)]
    escalate_threshold: Option<f64>,

    /// Wall-clock deadline for the whole run, in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Roll back a previous application by id
    #[arg(long)]
    rollback: Option<String>,

    /// Print the audit journal as CSV and exit
    #[arg(long)]
    audit_export: bool,

    /// Purge audit entries older than this many days, then exit
    #[arg(long)]
    audit_purge_days: Option<i64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(forge_err) = err.downcast_ref::<ForgeError>() {
                eprintln!("  Error [{}]: {}", forge_err.kind(), forge_err);
                eprintln!("  Hint: {}", forge_err.recommendation());
                return match forge_err {
                    ForgeError::ApplyFailed(_)
                    | ForgeError::ApplyConflict(_)
                    | ForgeError::ConcurrentApplication => ExitCode::from(3),
                    _ => ExitCode::from(2),
                };
            }
            eprintln!("  Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref(), &args.path);
    let overrides = apply_cli_overrides(&mut config, &args);

    let journal = AuditJournal::open(&config.resolved_log_dir())
        .context("could not open the audit journal")?;
    if !overrides.is_empty() {
        journal.record(AuditEntry::new(
            AuditEvent::ConfigChange,
            "cli",
            "config",
            "override",
            AuditStatus::Success,
            overrides.join(", "),
        ));
    }

    // Journal maintenance paths exit before any analysis.
    if args.audit_export {
        print!("{}", journal.export_csv());
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(days) = args.audit_purge_days {
        let purged = journal.purge_older_than(days)?;
        println!("  Purged {} audit entries older than {} days", purged, days);
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(application_id) = &args.rollback {
        let applicator = Applicator::new(&args.path, &journal);
        let result = applicator.rollback(application_id)?;
        println!(
            "  Rolled back {} files in {} ms ({} errors)",
            result.restored,
            result.duration_ms,
            result.errors.len()
        );
        for error in &result.errors {
            eprintln!("    {}", error);
        }
        return Ok(if result.errors.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(3)
        });
    }

    let log_path = args
        .log
        .as_ref()
        .context("--log is required (or use --rollback / --audit-export)")?;
    let raw_log = fs::read_to_string(log_path)
        .with_context(|| format!("could not read log {}", log_path.display()))?;
    let workflow_config = match &args.workflow {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("could not read workflow {}", path.display()))?,
        None => String::new(),
    };
    let change_set = match &args.diff {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("could not read diff {}", path.display()))?,
        None => String::new(),
    };

    if args.backend != "openrouter" {
        anyhow::bail!("unknown backend `{}` (only `openrouter` is supported)", args.backend);
    }
    let backend = if config.local_only {
        None
    } else {
        match &args.api_key {
            Some(key) => Some(OpenRouterBackend::new(key.clone(), config.temperature)),
            None => OpenRouterBackend::from_env(config.temperature),
        }
    };
    if backend.is_none() && !config.local_only {
        eprintln!("  No OPENROUTER_API_KEY set; running in local-only mode.");
    }

    let pipeline = Pipeline::new(
        &config,
        backend.as_ref().map(|b| b as &dyn forgefix::llm::ChatBackend),
        &journal,
    );
    let options = PipelineOptions {
        workflow_meta: None,
        apply: args.apply,
        deadline: args.deadline_secs.map(Duration::from_secs),
    };

    let outcome = pipeline
        .run(
            raw_log,
            workflow_config,
            change_set,
            &args.path,
            options,
            CancellationToken::new(),
        )
        .await?;

    print_outcome(&outcome);
    Ok(ExitCode::SUCCESS)
}

/// Returns a description of each override applied, for the journal.
fn apply_cli_overrides(config: &mut Config, args: &Args) -> Vec<String> {
    let mut overrides = Vec::new();
    if args.local {
        config.local_only = true;
        overrides.push("local_only=true".to_string());
    }
    if args.aggressive_redaction {
        config.aggressive_redaction = true;
        overrides.push("aggressive_redaction=true".to_string());
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = Some(dir.clone());
        overrides.push(format!("log_dir={}", dir.display()));
    }
    if let Some(t) = args.auto_threshold {
        config.auto_apply_threshold = t;
        overrides.push(format!("auto_apply_threshold={}", t));
    }
    if let Some(t) = args.review_threshold {
        config.manual_review_threshold = t;
        overrides.push(format!("manual_review_threshold={}", t));
    }
    if let Some(t) = args.escalate_threshold {
        config.escalate_threshold = t;
        overrides.push(format!("escalate_threshold={}", t));
    }
    overrides
}

fn print_outcome(outcome: &PipelineOutcome) {
    let analysis = &outcome.analysis;
    println!();
    println!(
        "  Failure: {} ({:?}) in step `{}`",
        analysis.primary.failure_type.as_str(),
        analysis.primary.severity,
        analysis.primary.step
    );
    println!(
        "  Confidence: {:.2} ({:?} blast radius)",
        analysis.confidence.score, analysis.blast_radius.level
    );
    if analysis.redaction.secrets_found > 0 {
        println!(
            "  Redacted {} secrets before analysis (risk {:?})",
            analysis.redaction.secrets_found, analysis.redaction.risk
        );
    }

    let Some(summary) = &outcome.summary else {
        println!("  Local-only run: no fix was generated.");
        return;
    };

    println!();
    println!("  {}", summary.title);
    println!("  {}", summary.summary);
    for item in &summary.action_items {
        println!("    - {}", item);
    }

    if let Some(decision) = &outcome.decision {
        println!();
        println!("  Gate: {:?} - {}", decision.action, decision.reasoning);
        for risk in &decision.risks {
            println!("    risk: {}", risk);
        }
        for recommendation in &decision.recommendations {
            println!("    next: {}", recommendation);
        }
    }

    if let Some(plan) = &outcome.plan {
        println!();
        println!(
            "  Plan: {} steps, {} files, {} lines ({:?} impact)",
            plan.summary.total_steps,
            plan.summary.files_affected,
            plan.summary.lines_changed,
            plan.impact
        );
    }

    match &outcome.record {
        Some(record) => {
            println!();
            println!("  Applied as {} ({:?})", record.id, record.status);
            println!("  Roll back with: forgefix --rollback {}", record.id);
        }
        None => {
            if outcome
                .decision
                .as_ref()
                .map(|d| d.action == GateAction::AutoApply)
                .unwrap_or(false)
            {
                println!("  Re-run with --apply to write the fix.");
            }
        }
    }

    for patch in &outcome.patches {
        println!();
        print!("{}", forgefix::diff::render_unified(patch));
    }
}
