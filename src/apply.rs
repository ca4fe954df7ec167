//! Transactional patch application and rollback
//!
//! The only component that writes to the working tree. Every application
//! snapshots its targets first, hashes every file before and after, and
//! persists the record plus per-file backups under the workspace state
//! directory. A per-root advisory lock serialises applications; violators
//! fail instead of queueing. Once snapshotting begins the operation is not
//! cancellable: it runs to completion or restores everything.

use crate::audit::{AuditEntry, AuditEvent, AuditJournal, AuditStatus};
use crate::diff::{apply_patch, FilePatch};
use crate::dryrun::{simulate, DryRunOptions};
use crate::error::ForgeError;
use crate::gate::{GateAction, GateDecision};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// State directory under the working-tree root.
const STATE_DIR: &str = ".forge/patches";
/// Advisory lock file within the state directory.
const LOCK_FILE: &str = ".lock";

/// SHA-256 of the given bytes, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash of the empty file; marks created targets in the record.
pub fn empty_hash() -> String {
    sha256_hex(b"")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStatus {
    Applied,
    RolledBack,
    Partial,
}

/// One applied patch with its on-disk hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub path: String,
    pub before_hash: String,
    pub after_hash: String,
    pub ts: DateTime<Utc>,
    pub patch: FilePatch,
}

/// The persisted record of one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub patches: Vec<AppliedPatch>,
    pub decision: GateDecision,
    pub status: ApplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a rollback.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub restored: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Apply even when the gate did not say auto-apply.
    pub auto_apply_override: bool,
    /// Run the dry-run simulator before touching anything.
    pub dry_run_first: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            auto_apply_override: false,
            dry_run_first: true,
        }
    }
}

/// RAII guard over the per-root advisory lock.
struct RootLock {
    _file: File,
}

fn acquire_root_lock(state_dir: &Path) -> Result<RootLock, ForgeError> {
    fs::create_dir_all(state_dir)
        .map_err(|e| ForgeError::ApplyFailed(format!("cannot create state directory: {}", e)))?;
    let lock_path = state_dir.join(LOCK_FILE);
    let file = File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| ForgeError::ApplyFailed(format!("cannot open lock file: {}", e)))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(RootLock { _file: file }),
        Err(_) => Err(ForgeError::ConcurrentApplication),
    }
}

pub struct Applicator<'a> {
    root: &'a Path,
    journal: &'a AuditJournal,
}

impl<'a> Applicator<'a> {
    pub fn new(root: &'a Path, journal: &'a AuditJournal) -> Self {
        Self { root, journal }
    }

    fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn record_dir(&self, id: &Uuid) -> PathBuf {
        self.state_dir().join(id.to_string())
    }

    fn backup_path(&self, id: &Uuid, rel: &str) -> PathBuf {
        self.record_dir(id).join("backups").join(rel.replace('/', "__"))
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.record_dir(id).join("record.json")
    }

    /// Apply `patches` transactionally.
    ///
    /// Either every patch lands (status `Applied`) or every touched file is
    /// restored from its snapshot and the call returns `ApplyFailed` with a
    /// `Partial` record persisted for the audit trail.
    pub fn apply_patches(
        &self,
        patches: &[FilePatch],
        decision: &GateDecision,
        options: &ApplyOptions,
    ) -> Result<ApplicationRecord, ForgeError> {
        if decision.action != GateAction::AutoApply && !options.auto_apply_override {
            return Err(ForgeError::InputInvalid(format!(
                "gate decided {:?}; pass the override to apply anyway",
                decision.action
            )));
        }
        for patch in patches {
            validate_rel_path(&patch.path)?;
        }

        let _lock = acquire_root_lock(&self.state_dir())?;

        if options.dry_run_first {
            // Applicator dry runs are not cancellable; the transaction
            // either happens or it does not.
            let plan = simulate(self.root, patches, DryRunOptions::default(), &CancellationToken::new());
            if !plan.success {
                let reason = plan
                    .steps
                    .iter()
                    .find(|s| s.status == crate::dryrun::StepStatus::Error)
                    .map(|s| s.message.clone())
                    .unwrap_or_else(|| "dry run predicted failure".to_string());
                return Err(ForgeError::ApplyConflict(reason));
            }
        }

        let id = Uuid::new_v4();
        let record_dir = self.record_dir(&id);
        fs::create_dir_all(record_dir.join("backups"))
            .map_err(|e| ForgeError::ApplyFailed(format!("cannot create record directory: {}", e)))?;

        // Step 1: snapshot every existing, non-created target.
        let mut snapshots: HashMap<String, String> = HashMap::new();
        for patch in patches {
            if patch.is_new {
                continue;
            }
            let target = self.root.join(&patch.path);
            if target.exists() {
                let content = fs::read_to_string(&target).map_err(|e| {
                    ForgeError::ApplyFailed(format!("snapshot of `{}` failed: {}", patch.path, e))
                })?;
                fs::write(self.backup_path(&id, &patch.path), &content).map_err(|e| {
                    ForgeError::ApplyFailed(format!("backup of `{}` failed: {}", patch.path, e))
                })?;
                snapshots.insert(patch.path.clone(), content);
            }
        }

        // Step 2: apply sequentially; stop at the first failure.
        let mut applied: Vec<AppliedPatch> = Vec::new();
        let mut failure: Option<String> = None;

        for patch in patches {
            match self.apply_one(patch, &snapshots) {
                Ok(applied_patch) => applied.push(applied_patch),
                Err(message) => {
                    failure = Some(format!("`{}`: {}", patch.path, message));
                    break;
                }
            }
        }

        // Step 3: on failure, restore every snapshot and undo creates.
        if let Some(message) = failure {
            let restore_errors = self.restore_snapshots(&snapshots, patches);
            let error_text = if restore_errors.is_empty() {
                format!("{} (all snapshots restored)", message)
            } else {
                format!(
                    "{} (restoration incomplete: {})",
                    message,
                    restore_errors.join("; ")
                )
            };

            let record = ApplicationRecord {
                id,
                ts: Utc::now(),
                patches: applied,
                decision: decision.clone(),
                status: ApplyStatus::Partial,
                error: Some(error_text.clone()),
            };
            self.persist_record(&record)?;
            self.journal.record(
                AuditEntry::new(
                    AuditEvent::FixApplied,
                    "applicator",
                    &self.root.display().to_string(),
                    "apply_patches",
                    AuditStatus::Failure,
                    &error_text,
                )
                .with_metadata("application_id", id.to_string()),
            );
            return Err(ForgeError::ApplyFailed(error_text));
        }

        // Step 4: persist and journal success.
        let record = ApplicationRecord {
            id,
            ts: Utc::now(),
            patches: applied,
            decision: decision.clone(),
            status: ApplyStatus::Applied,
            error: None,
        };
        self.persist_record(&record)?;
        self.journal.record(
            AuditEntry::new(
                AuditEvent::FixApplied,
                "applicator",
                &self.root.display().to_string(),
                "apply_patches",
                AuditStatus::Success,
                format!("{} patches applied", record.patches.len()),
            )
            .with_metadata("application_id", id.to_string()),
        );
        tracing::info!(application_id = %id, patches = record.patches.len(), "patches applied");
        Ok(record)
    }

    fn apply_one(
        &self,
        patch: &FilePatch,
        snapshots: &HashMap<String, String>,
    ) -> Result<AppliedPatch, String> {
        let target = self.root.join(&patch.path);

        if patch.is_new {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| format!("mkdir failed: {}", e))?;
            }
            let content = apply_patch("", patch)?;
            fs::write(&target, &content).map_err(|e| format!("write failed: {}", e))?;
            let written = fs::read(&target).map_err(|e| format!("read-back failed: {}", e))?;
            return Ok(AppliedPatch {
                path: patch.path.clone(),
                before_hash: empty_hash(),
                after_hash: sha256_hex(&written),
                ts: Utc::now(),
                patch: patch.clone(),
            });
        }

        let current = snapshots
            .get(&patch.path)
            .cloned()
            .ok_or_else(|| "target was not snapshotted".to_string())?;
        let before_hash = sha256_hex(current.as_bytes());

        if patch.is_deleted {
            fs::remove_file(&target).map_err(|e| format!("unlink failed: {}", e))?;
            return Ok(AppliedPatch {
                path: patch.path.clone(),
                before_hash,
                after_hash: empty_hash(),
                ts: Utc::now(),
                patch: patch.clone(),
            });
        }

        let next = apply_patch(&current, patch)?;
        fs::write(&target, &next).map_err(|e| format!("write failed: {}", e))?;
        let written = fs::read(&target).map_err(|e| format!("read-back failed: {}", e))?;
        Ok(AppliedPatch {
            path: patch.path.clone(),
            before_hash,
            after_hash: sha256_hex(&written),
            ts: Utc::now(),
            patch: patch.clone(),
        })
    }

    /// Put every snapshotted file back and remove files created this run.
    fn restore_snapshots(
        &self,
        snapshots: &HashMap<String, String>,
        patches: &[FilePatch],
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for (rel, content) in snapshots {
            let target = self.root.join(rel);
            if let Err(e) = fs::write(&target, content) {
                errors.push(format!("restore `{}`: {}", rel, e));
            }
        }
        for patch in patches.iter().filter(|p| p.is_new) {
            let target = self.root.join(&patch.path);
            if target.exists() {
                if let Err(e) = fs::remove_file(&target) {
                    errors.push(format!("remove created `{}`: {}", patch.path, e));
                }
            }
        }
        errors
    }

    fn persist_record(&self, record: &ApplicationRecord) -> Result<(), ForgeError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| ForgeError::ApplyFailed(format!("record serialisation failed: {}", e)))?;
        fs::write(self.record_path(&record.id), json)
            .map_err(|e| ForgeError::ApplyFailed(format!("record write failed: {}", e)))
    }

    /// Load a previously persisted record.
    pub fn load_record(&self, application_id: &str) -> Result<ApplicationRecord, ForgeError> {
        let id = Uuid::parse_str(application_id)
            .map_err(|_| ForgeError::InputInvalid(format!("bad application id `{}`", application_id)))?;
        let content = fs::read_to_string(self.record_path(&id)).map_err(|_| {
            ForgeError::InputInvalid(format!("no record found for `{}`", application_id))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ForgeError::ApplyFailed(format!("record parse failed: {}", e)))
    }

    /// Undo a previous application, newest patch first.
    ///
    /// Created files are deleted; everything else is restored verbatim from
    /// the recorded backup blob. Idempotent in the absence of external
    /// tampering; backups are never removed.
    pub fn rollback(&self, application_id: &str) -> Result<RollbackResult, ForgeError> {
        let started = Instant::now();
        let mut record = self.load_record(application_id)?;
        let _lock = acquire_root_lock(&self.state_dir())?;

        let empty = empty_hash();
        let mut restored = 0usize;
        let mut errors = Vec::new();

        for applied in record.patches.iter().rev() {
            let target = self.root.join(&applied.path);

            if applied.before_hash == empty {
                // The apply created this file; rollback removes it.
                if target.exists() {
                    match fs::remove_file(&target) {
                        Ok(()) => restored += 1,
                        Err(e) => errors.push(format!("remove `{}`: {}", applied.path, e)),
                    }
                } else {
                    restored += 1;
                }
                continue;
            }

            let backup = self.backup_path(&record.id, &applied.path);
            match fs::read_to_string(&backup) {
                Ok(content) => {
                    if let Some(parent) = target.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    match fs::write(&target, &content) {
                        Ok(()) => restored += 1,
                        Err(e) => errors.push(format!("restore `{}`: {}", applied.path, e)),
                    }
                }
                Err(e) => errors.push(format!("backup for `{}` unreadable: {}", applied.path, e)),
            }
        }

        record.status = if errors.is_empty() {
            ApplyStatus::RolledBack
        } else {
            ApplyStatus::Partial
        };
        self.persist_record(&record)?;

        let status = if errors.is_empty() {
            AuditStatus::Success
        } else {
            AuditStatus::Warning
        };
        self.journal.record(
            AuditEntry::new(
                AuditEvent::FixReverted,
                "applicator",
                &self.root.display().to_string(),
                "rollback",
                status,
                format!("{} files restored, {} errors", restored, errors.len()),
            )
            .with_metadata("application_id", application_id.to_string()),
        );

        Ok(RollbackResult {
            restored,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Patch paths must stay inside the working tree.
fn validate_rel_path(path: &str) -> Result<(), ForgeError> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(ForgeError::InputInvalid(format!(
            "patch path `{}` must be relative and inside the working tree",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{compute_patch, DEFAULT_CONTEXT};
    use tempfile::tempdir;

    fn auto_decision() -> GateDecision {
        GateDecision {
            action: GateAction::AutoApply,
            confidence: 0.95,
            reasoning: "test".to_string(),
            risks: vec![],
            recommendations: vec![],
        }
    }

    fn journal(dir: &Path) -> AuditJournal {
        AuditJournal::open(&dir.join("audit")).unwrap()
    }

    #[test]
    fn test_three_file_apply_and_rollback_roundtrip() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("modify.txt"), "a\nb\nc").unwrap();
        fs::write(root.join("remove.txt"), "doomed").unwrap();

        let journal = journal(root);
        let applicator = Applicator::new(root, &journal);

        let patches = vec![
            FilePatch::create("fresh.txt", "hello\nworld"),
            compute_patch("modify.txt", "a\nb\nc", "a\nB\nc", DEFAULT_CONTEXT).unwrap(),
            FilePatch::delete("remove.txt", "doomed"),
        ];

        let record = applicator
            .apply_patches(&patches, &auto_decision(), &ApplyOptions::default())
            .unwrap();
        assert_eq!(record.status, ApplyStatus::Applied);
        assert_eq!(record.patches.len(), 3);

        // Post-image hashes match what is on disk.
        for applied in &record.patches {
            let target = root.join(&applied.path);
            let on_disk = if target.exists() {
                fs::read(&target).unwrap()
            } else {
                Vec::new()
            };
            assert_eq!(sha256_hex(&on_disk), applied.after_hash, "{}", applied.path);
        }
        assert_eq!(fs::read_to_string(root.join("modify.txt")).unwrap(), "a\nB\nc");
        assert!(!root.join("remove.txt").exists());

        // Rollback restores every pre-image.
        let result = applicator.rollback(&record.id.to_string()).unwrap();
        assert!(result.errors.is_empty());
        assert_eq!(result.restored, 3);
        assert!(!root.join("fresh.txt").exists());
        assert_eq!(fs::read_to_string(root.join("modify.txt")).unwrap(), "a\nb\nc");
        assert_eq!(fs::read_to_string(root.join("remove.txt")).unwrap(), "doomed");

        for applied in &record.patches {
            let target = root.join(&applied.path);
            let on_disk = if target.exists() {
                fs::read(&target).unwrap()
            } else {
                Vec::new()
            };
            assert_eq!(sha256_hex(&on_disk), applied.before_hash, "{}", applied.path);
        }

        let reloaded = applicator.load_record(&record.id.to_string()).unwrap();
        assert_eq!(reloaded.status, ApplyStatus::RolledBack);
    }

    #[test]
    fn test_decision_gates_application() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let applicator = Applicator::new(dir.path(), &journal);

        let mut decision = auto_decision();
        decision.action = GateAction::ManualReview;
        let patches = vec![FilePatch::create("a.txt", "x")];

        let result = applicator.apply_patches(&patches, &decision, &ApplyOptions::default());
        assert!(matches!(result, Err(ForgeError::InputInvalid(_))));

        let options = ApplyOptions {
            auto_apply_override: true,
            ..ApplyOptions::default()
        };
        assert!(applicator.apply_patches(&patches, &decision, &options).is_ok());
    }

    #[test]
    fn test_dry_run_conflict_blocks_apply() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("exists.txt"), "x").unwrap();
        let journal = journal(dir.path());
        let applicator = Applicator::new(dir.path(), &journal);

        let patches = vec![FilePatch::create("exists.txt", "y")];
        let result = applicator.apply_patches(&patches, &auto_decision(), &ApplyOptions::default());
        assert!(matches!(result, Err(ForgeError::ApplyConflict(_))));
        // Nothing was touched.
        assert_eq!(fs::read_to_string(dir.path().join("exists.txt")).unwrap(), "x");
    }

    #[test]
    fn test_failure_mid_sequence_restores_snapshots() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("one.txt"), "1\n2\n3").unwrap();
        fs::write(root.join("two.txt"), "x\ny\nz").unwrap();

        let journal = journal(root);
        let applicator = Applicator::new(root, &journal);

        // Second patch is stale: it expects content two.txt no longer has.
        let good = compute_patch("one.txt", "1\n2\n3", "1\nTWO\n3", DEFAULT_CONTEXT).unwrap();
        let stale = compute_patch("two.txt", "a\nb\nc", "a\nB\nc", DEFAULT_CONTEXT).unwrap();

        // Skip the dry run so the failure happens inside the transaction.
        let options = ApplyOptions {
            dry_run_first: false,
            ..ApplyOptions::default()
        };
        let result = applicator.apply_patches(&[good, stale], &auto_decision(), &options);
        assert!(matches!(result, Err(ForgeError::ApplyFailed(_))));

        // The first patch was applied and then restored.
        assert_eq!(fs::read_to_string(root.join("one.txt")).unwrap(), "1\n2\n3");
        assert_eq!(fs::read_to_string(root.join("two.txt")).unwrap(), "x\ny\nz");
    }

    #[test]
    fn test_concurrent_application_lock() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join(STATE_DIR);
        let _held = acquire_root_lock(&state_dir).unwrap();

        let journal = journal(dir.path());
        let applicator = Applicator::new(dir.path(), &journal);
        let patches = vec![FilePatch::create("a.txt", "x")];
        let result = applicator.apply_patches(&patches, &auto_decision(), &ApplyOptions::default());
        assert!(matches!(result, Err(ForgeError::ConcurrentApplication)));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join(STATE_DIR);
        {
            let _guard = acquire_root_lock(&state_dir).unwrap();
        }
        assert!(acquire_root_lock(&state_dir).is_ok());
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("f.txt"), "before").unwrap();

        let journal = journal(root);
        let applicator = Applicator::new(root, &journal);
        let patches = vec![compute_patch("f.txt", "before", "after", DEFAULT_CONTEXT).unwrap()];
        let record = applicator
            .apply_patches(&patches, &auto_decision(), &ApplyOptions::default())
            .unwrap();

        let first = applicator.rollback(&record.id.to_string()).unwrap();
        let second = applicator.rollback(&record.id.to_string()).unwrap();
        assert!(first.errors.is_empty());
        assert!(second.errors.is_empty());
        assert_eq!(fs::read_to_string(root.join("f.txt")).unwrap(), "before");
    }

    #[test]
    fn test_backups_never_removed() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("f.txt"), "before").unwrap();

        let journal = journal(root);
        let applicator = Applicator::new(root, &journal);
        let patches = vec![compute_patch("f.txt", "before", "after", DEFAULT_CONTEXT).unwrap()];
        let record = applicator
            .apply_patches(&patches, &auto_decision(), &ApplyOptions::default())
            .unwrap();
        applicator.rollback(&record.id.to_string()).unwrap();

        let backup = applicator.backup_path(&record.id, "f.txt");
        assert!(backup.exists());
        assert_eq!(fs::read_to_string(backup).unwrap(), "before");
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let applicator = Applicator::new(dir.path(), &journal);

        for bad in ["../outside.txt", "/etc/passwd", "a/../../b"] {
            let patches = vec![FilePatch::create(bad, "x")];
            let result =
                applicator.apply_patches(&patches, &auto_decision(), &ApplyOptions::default());
            assert!(matches!(result, Err(ForgeError::InputInvalid(_))), "{}", bad);
        }
    }

    #[test]
    fn test_apply_journals_success() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let applicator = Applicator::new(dir.path(), &journal);
        let patches = vec![FilePatch::create("a.txt", "x")];
        applicator
            .apply_patches(&patches, &auto_decision(), &ApplyOptions::default())
            .unwrap();

        let entries = journal.query_by_status(AuditStatus::Success);
        assert!(entries.iter().any(|e| e.action == "apply_patches"));
    }
}
