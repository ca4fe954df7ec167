//! End-to-end scenarios against a scripted backend
//!
//! Each test seeds a working tree, replays canned expert responses, and
//! checks the terminal behaviour: classification, gate verdict, and what
//! ends up on disk.

use crate::audit::AuditJournal;
use crate::config::Config;
use crate::error::ForgeError;
use crate::gate::GateAction;
use crate::llm::testing::ScriptedBackend;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::rules::FailureType;
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn config() -> Config {
    Config::default()
}

fn journal(root: &Path) -> AuditJournal {
    AuditJournal::open(&root.join(".audit")).unwrap()
}

fn analyst(failure_type: &str, summary: &str) -> String {
    json!({
        "failureType": failure_type,
        "severity": "critical",
        "summary": summary,
        "rootCauseLines": [],
        "contextLines": [],
        "suggestedSearchTerms": []
    })
    .to_string()
}

fn workflow(issue_type: &str, changes: serde_json::Value) -> String {
    json!({
        "issueType": issue_type,
        "recommendation": "apply the proposed workflow change",
        "yamlChanges": changes,
        "riskLevel": "medium"
    })
    .to_string()
}

fn review_clean() -> String {
    json!({"issuesFound": [], "overallScore": 92, "blockers": []}).to_string()
}

fn fix(file: &str, content: &str, confidence: f64) -> String {
    json!({
        "confidence": confidence,
        "fixFile": file,
        "fixStartLine": 1,
        "fixContent": content,
        "explanation": "smallest change that resolves the logged failure"
    })
    .to_string()
}

async fn run_pipeline(
    cfg: &Config,
    backend: &ScriptedBackend,
    root: &Path,
    log: &str,
    workflow_file: &str,
) -> Result<crate::pipeline::PipelineOutcome, ForgeError> {
    let journal = journal(root);
    let pipeline = Pipeline::new(cfg, Some(backend), &journal);
    pipeline
        .run(
            log.to_string(),
            workflow_file.to_string(),
            String::new(),
            root,
            PipelineOptions::default(),
            CancellationToken::new(),
        )
        .await
}

// Scenario: a publish job hits the registry without credentials.
#[tokio::test]
async fn scenario_missing_registry_auth() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let workflow_yaml = "name: publish\non: push\njobs:\n  publish:\n    runs-on: ubuntu-latest\n    steps:\n      - uses: actions/setup-node@v4\n      - run: npm publish\n";
    fs::write(root.join("publish.yml"), workflow_yaml).unwrap();

    let log = "##[group]Run npm publish\nnpm ERR! code E403\n403 Forbidden - PUT https://registry.npmjs.org/my-pkg";
    let fixed = "name: publish\non: push\njobs:\n  publish:\n    runs-on: ubuntu-latest\n    steps:\n      - uses: actions/setup-node@v4\n        with:\n          registry-url: https://registry.npmjs.org\n      - run: npm publish\n        env:\n          NODE_AUTH_TOKEN: ${{ secrets.NPM_TOKEN }}\n";

    let backend = ScriptedBackend::new(vec![
        Ok(analyst("auth", "publish rejected with E403; registry auth missing")),
        Ok(workflow(
            "secrets",
            json!([{
                "path": "jobs.publish.steps[0].with.registry-url",
                "oldValue": "",
                "newValue": "https://registry.npmjs.org",
                "reason": "setup-node needs a registry to mint the auth header"
            }]),
        )),
        Ok(review_clean()),
        Ok(fix("publish.yml", fixed, 0.93)),
    ]);

    let outcome = run_pipeline(&config(), &backend, root, log, workflow_yaml)
        .await
        .unwrap();

    assert_eq!(outcome.analysis.primary.failure_type, FailureType::Auth);
    assert!(
        outcome.analysis.confidence.score >= 0.90,
        "score {}",
        outcome.analysis.confidence.score
    );
    let summary = outcome.summary.as_ref().unwrap();
    assert_eq!(summary.agents.workflow_expert.issue_type, "secrets");

    let rendered = crate::diff::render_unified(&outcome.patches[0]);
    assert!(rendered.contains("+          registry-url: https://registry.npmjs.org"));
    assert!(rendered.contains("+          NODE_AUTH_TOKEN: ${{ secrets.NPM_TOKEN }}"));
}

// Scenario: pushing an image fails because the job can only read contents.
#[tokio::test]
async fn scenario_container_registry_permission() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let workflow_yaml = "name: docker\non: push\njobs:\n  build:\n    runs-on: ubuntu-latest\n    permissions:\n      contents: read\n    steps:\n      - run: docker push ghcr.io/acme/app\n";
    fs::write(root.join("docker.yml"), workflow_yaml).unwrap();

    let log = "denied: denied\nunauthorized: authentication required";
    let fixed = "name: docker\non: push\njobs:\n  build:\n    runs-on: ubuntu-latest\n    permissions:\n      contents: read\n      packages: write\n    steps:\n      - run: docker push ghcr.io/acme/app\n";

    let backend = ScriptedBackend::new(vec![
        Ok(analyst("auth", "registry push denied; job lacks packages: write")),
        Ok(workflow(
            "permissions",
            json!([{
                "path": "jobs.build.permissions.packages",
                "oldValue": "",
                "newValue": "write",
                "reason": "pushing to the container registry needs packages: write"
            }]),
        )),
        Ok(review_clean()),
        Ok(fix("docker.yml", fixed, 0.94)),
    ]);

    let outcome = run_pipeline(&config(), &backend, root, log, workflow_yaml)
        .await
        .unwrap();

    assert_eq!(outcome.analysis.primary.failure_type, FailureType::Auth);
    assert!(outcome.analysis.confidence.score >= 0.90);
    let summary = outcome.summary.as_ref().unwrap();
    assert!(summary.agents.workflow_expert.yaml_changes[0]
        .path
        .contains("permissions"));

    // The permissions edit trips the security lexicon.
    let decision = outcome.decision.unwrap();
    assert_eq!(decision.action, GateAction::ManualReview);
    assert!(decision.reasoning.contains("security review"));
}

// Scenario: the deploy step references secrets nobody defined.
#[tokio::test]
async fn scenario_missing_deploy_secrets() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let workflow_yaml = "name: deploy\non: push\njobs:\n  deploy:\n    runs-on: ubuntu-latest\n    steps:\n      - run: ./deploy.sh\n";
    fs::write(root.join("deploy.yml"), workflow_yaml).unwrap();

    let log = "Error: secret 'stage.prod.DB_PASSWORD' is not defined\n\
               Error: secret 'stage.prod.API_TOKEN' is not defined\n\
               Error: secret 'stage.prod.SIGNING_CERT' is not defined";
    let fixed = "name: deploy\non: push\njobs:\n  deploy:\n    runs-on: ubuntu-latest\n    steps:\n      - run: ./deploy.sh\n        env:\n          DB_PASSWORD: ${{ secrets.STAGE_PROD_DB_PASSWORD }}\n          API_TOKEN: ${{ secrets.STAGE_PROD_API_TOKEN }}\n          SIGNING_CERT: ${{ secrets.STAGE_PROD_SIGNING_CERT }}\n";

    let backend = ScriptedBackend::new(vec![
        Ok(analyst("env", "three deploy secrets are referenced but not defined")),
        Ok(workflow(
            "secrets",
            json!([{
                "path": "jobs.deploy.steps[0].env.DB_PASSWORD",
                "oldValue": "",
                "newValue": "${{ secrets.STAGE_PROD_DB_PASSWORD }}",
                "reason": "deploy.sh reads this from the environment"
            }]),
        )),
        Ok(review_clean()),
        Ok(fix("deploy.yml", fixed, 0.91)),
    ]);

    let outcome = run_pipeline(&config(), &backend, root, log, workflow_yaml)
        .await
        .unwrap();

    assert_eq!(outcome.analysis.primary.failure_type, FailureType::Env);
    assert!(
        outcome.analysis.confidence.score >= 0.85,
        "score {}",
        outcome.analysis.confidence.score
    );

    let rendered = crate::diff::render_unified(&outcome.patches[0]);
    assert!(rendered.contains("+          DB_PASSWORD:"));
    assert!(rendered.contains("+          API_TOKEN:"));
    assert!(rendered.contains("+          SIGNING_CERT:"));

    let decision = outcome.decision.unwrap();
    assert_eq!(decision.action, GateAction::ManualReview);
    assert!(decision.reasoning.contains("security review"));
}

// Scenario: the test matrix still carries end-of-life Node versions.
#[tokio::test]
async fn scenario_end_of_life_runtime_matrix() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let workflow_yaml = "name: test\non: push\njobs:\n  test:\n    runs-on: ubuntu-latest\n    strategy:\n      matrix:\n        node: [12, 14, 16, 18]\n    steps:\n      - run: npm test\n";
    fs::write(root.join("node-ci.yml"), workflow_yaml).unwrap();

    let log = "##[group]Run npm test\nReferenceError: crypto.subtle is not available in Node 14\nnpm test failed";
    let fixed = "name: test\non: push\njobs:\n  test:\n    runs-on: ubuntu-latest\n    strategy:\n      matrix:\n        node: [16, 18, 20]\n    steps:\n      - run: npm test\n";

    let backend = ScriptedBackend::new(vec![
        Ok(analyst("build", "crypto.subtle requires Node 16+; 12 and 14 are EOL")),
        Ok(workflow(
            "matrix",
            json!([{
                "path": "jobs.test.strategy.matrix.node",
                "oldValue": "[12, 14, 16, 18]",
                "newValue": "[16, 18, 20]",
                "reason": "drop end-of-life versions, add current LTS"
            }]),
        )),
        Ok(review_clean()),
        Ok(fix("node-ci.yml", fixed, 0.92)),
    ]);

    // The analyst reports critical severity, so auto-apply needs the flag.
    let mut cfg = config();
    cfg.allow_auto_apply_on_critical = true;
    let outcome = run_pipeline(&cfg, &backend, root, log, workflow_yaml)
        .await
        .unwrap();

    assert_eq!(outcome.analysis.primary.failure_type, FailureType::Build);
    assert!(
        outcome.analysis.confidence.score >= 0.80,
        "score {}",
        outcome.analysis.confidence.score
    );

    let rendered = crate::diff::render_unified(&outcome.patches[0]);
    assert!(rendered.contains("-        node: [12, 14, 16, 18]"));
    assert!(rendered.contains("+        node: [16, 18, 20]"));

    // No security match, no validation errors: the gate clears it.
    let decision = outcome.decision.unwrap();
    assert_eq!(decision.action, GateAction::AutoApply);
}

// Scenario: the Log Analyst needs two corrections before valid JSON.
#[tokio::test]
async fn scenario_schema_violation_recovery() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("ci.yml"), "name: ci\n").unwrap();

    let backend = ScriptedBackend::new(vec![
        Ok("I think the failure is auth-related.".to_string()),
        Ok(json!({"failureType": "auth"}).to_string()),
        Ok(analyst("auth", "publish rejected with E403")),
        Ok(workflow("none", json!([]))),
        Ok(review_clean()),
        Ok(fix("ci.yml", "name: ci\nrun-name: retry\n", 0.95)),
    ]);

    let mut cfg = config();
    cfg.allow_auto_apply_on_critical = true;
    let outcome = run_pipeline(
        &cfg,
        &backend,
        root,
        "npm ERR! code E403",
        "name: ci\n",
    )
    .await
    .unwrap();

    let summary = outcome.summary.unwrap();
    assert_eq!(summary.retries_used, 2);

    // Each retry carried a correction directive naming the violated paths.
    let prompts = backend.prompts();
    assert!(prompts[1].contains("violated the required schema"));
    assert!(prompts[1].contains("response:"));
    assert!(prompts[2].contains("severity"));
    assert!(prompts[2].contains("summary"));
}
