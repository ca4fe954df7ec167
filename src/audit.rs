//! Append-only audit journal
//!
//! Every terminal action in the pipeline is journaled: secret scans, fix
//! generation, applications, rollbacks, validation checks, and security
//! events. Entries are kept in a bounded in-memory window and persisted as
//! newline-delimited JSON. The journal is singleton-per-process and
//! tolerates concurrent appenders.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory retention window.
const DEFAULT_RETENTION: usize = 10_000;
/// Journal file name under the log directory.
const JOURNAL_FILE: &str = "forge-audit.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SecretsScan,
    FixGenerated,
    FixApplied,
    FixReverted,
    ValidationCheck,
    AccessDenied,
    SecurityAlert,
    ConfigChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub event: AuditEvent,
    pub actor: String,
    pub resource: String,
    pub action: String,
    pub status: AuditStatus,
    pub details: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(
        event: AuditEvent,
        actor: &str,
        resource: &str,
        action: &str,
        status: AuditStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            event,
            actor: actor.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            status,
            details: details.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

struct JournalInner {
    entries: VecDeque<AuditEntry>,
    retention: usize,
}

/// The process-wide journal. Appends are serialised behind the mutex, which
/// also covers the file write so persisted order matches in-memory order.
pub struct AuditJournal {
    inner: Mutex<JournalInner>,
    path: PathBuf,
}

impl AuditJournal {
    /// Open (or create) the journal under `log_dir`.
    pub fn open(log_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(JOURNAL_FILE);

        // Reload the persisted tail so queries see prior runs.
        let mut entries = VecDeque::new();
        if let Ok(content) = fs::read_to_string(&path) {
            for line in content.lines() {
                if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
                    entries.push_back(entry);
                }
            }
            while entries.len() > DEFAULT_RETENTION {
                entries.pop_front();
            }
        }

        Ok(Self {
            inner: Mutex::new(JournalInner {
                entries,
                retention: DEFAULT_RETENTION,
            }),
            path,
        })
    }

    #[cfg(test)]
    fn with_retention(log_dir: &Path, retention: usize) -> std::io::Result<Self> {
        let journal = Self::open(log_dir)?;
        journal.inner.lock().expect("journal lock").retention = retention;
        Ok(journal)
    }

    /// Append one entry. Returns its id.
    pub fn record(&self, entry: AuditEntry) -> Uuid {
        let id = entry.id;
        let mut inner = self.inner.lock().expect("journal lock");

        if let Ok(line) = serde_json::to_string(&entry) {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{}", line) {
                        tracing::warn!(%err, "audit journal write failed");
                    }
                }
                Err(err) => tracing::warn!(%err, "audit journal open failed"),
            }
        }

        inner.entries.push_back(entry);
        while inner.entries.len() > inner.retention {
            inner.entries.pop_front();
        }
        id
    }

    /// Entries touching `resource`, oldest first.
    pub fn query_by_resource(&self, resource: &str) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("journal lock");
        inner
            .entries
            .iter()
            .filter(|e| e.resource == resource)
            .cloned()
            .collect()
    }

    /// Entries within `[from, to]`.
    pub fn query_by_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("journal lock");
        inner
            .entries
            .iter()
            .filter(|e| e.ts >= from && e.ts <= to)
            .cloned()
            .collect()
    }

    /// Entries with the given status.
    pub fn query_by_status(&self, status: AuditStatus) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("journal lock");
        inner
            .entries
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    /// Drop entries older than `days` from memory and rewrite the file.
    pub fn purge_older_than(&self, days: i64) -> std::io::Result<usize> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut inner = self.inner.lock().expect("journal lock");
        let before = inner.entries.len();
        inner.entries.retain(|e| e.ts >= cutoff);
        let purged = before - inner.entries.len();

        if purged > 0 {
            let mut out = String::new();
            for entry in &inner.entries {
                if let Ok(line) = serde_json::to_string(entry) {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            fs::write(&self.path, out)?;
        }
        Ok(purged)
    }

    /// Export the in-memory window as CSV.
    pub fn export_csv(&self) -> String {
        let inner = self.inner.lock().expect("journal lock");
        let mut out = String::from("id,ts,event,actor,resource,action,status,details\n");
        for e in &inner.entries {
            out.push_str(&format!(
                "{},{},{:?},{},{},{},{:?},{}\n",
                e.id,
                e.ts.to_rfc3339(),
                e.event,
                csv_field(&e.actor),
                csv_field(&e.resource),
                csv_field(&e.action),
                e.status,
                csv_field(&e.details),
            ));
        }
        out
    }

    /// Entry counts by event kind and by status.
    pub fn stats(&self) -> (BTreeMap<String, usize>, BTreeMap<String, usize>) {
        let inner = self.inner.lock().expect("journal lock");
        let mut by_event = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        for e in &inner.entries {
            *by_event.entry(format!("{:?}", e.event)).or_insert(0) += 1;
            *by_status.entry(format!("{:?}", e.status)).or_insert(0) += 1;
        }
        (by_event, by_status)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("journal lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(resource: &str, status: AuditStatus) -> AuditEntry {
        AuditEntry::new(
            AuditEvent::FixApplied,
            "pipeline",
            resource,
            "apply",
            status,
            "details",
        )
    }

    #[test]
    fn test_record_and_query_by_resource() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        journal.record(entry("a.yml", AuditStatus::Success));
        journal.record(entry("b.yml", AuditStatus::Success));

        let hits = journal.query_by_resource("a.yml");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].resource, "a.yml");
    }

    #[test]
    fn test_persisted_as_ndjson() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        journal.record(entry("a.yml", AuditStatus::Success));
        journal.record(entry("b.yml", AuditStatus::Failure));

        let content = fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<AuditEntry>(line).unwrap();
        }
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = tempdir().unwrap();
        {
            let journal = AuditJournal::open(dir.path()).unwrap();
            journal.record(entry("a.yml", AuditStatus::Success));
        }
        let journal = AuditJournal::open(dir.path()).unwrap();
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_retention_bounded() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::with_retention(dir.path(), 3).unwrap();
        for i in 0..5 {
            journal.record(entry(&format!("f{}.yml", i), AuditStatus::Success));
        }
        assert_eq!(journal.len(), 3);
        // Oldest entries were evicted from memory.
        assert!(journal.query_by_resource("f0.yml").is_empty());
        assert_eq!(journal.query_by_resource("f4.yml").len(), 1);
    }

    #[test]
    fn test_query_by_status_and_range() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        journal.record(entry("a.yml", AuditStatus::Success));
        journal.record(entry("b.yml", AuditStatus::Failure));

        assert_eq!(journal.query_by_status(AuditStatus::Failure).len(), 1);

        let hour_ago = Utc::now() - Duration::hours(1);
        let hour_ahead = Utc::now() + Duration::hours(1);
        assert_eq!(journal.query_by_range(hour_ago, hour_ahead).len(), 2);
        assert!(journal
            .query_by_range(hour_ago, hour_ago + Duration::minutes(1))
            .is_empty());
    }

    #[test]
    fn test_purge_rewrites_file() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        let mut old = entry("old.yml", AuditStatus::Success);
        old.ts = Utc::now() - Duration::days(90);
        journal.record(old);
        journal.record(entry("new.yml", AuditStatus::Success));

        let purged = journal.purge_older_than(30).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(journal.len(), 1);

        let content = fs::read_to_string(journal.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("new.yml"));
    }

    #[test]
    fn test_csv_export_escapes_fields() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        journal.record(AuditEntry::new(
            AuditEvent::SecurityAlert,
            "pipeline",
            "a.yml",
            "scan",
            AuditStatus::Warning,
            "found \"token\", redacted",
        ));

        let csv = journal.export_csv();
        assert!(csv.starts_with("id,ts,event,"));
        assert!(csv.contains("\"found \"\"token\"\", redacted\""));
    }

    #[test]
    fn test_concurrent_appenders() {
        let dir = tempdir().unwrap();
        let journal = std::sync::Arc::new(AuditJournal::open(dir.path()).unwrap());
        let mut handles = Vec::new();
        for t in 0..4 {
            let journal = journal.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    journal.record(entry(&format!("t{}-{}.yml", t, i), AuditStatus::Success));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(journal.len(), 100);
        let content = fs::read_to_string(journal.path()).unwrap();
        assert_eq!(content.lines().count(), 100);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        journal.record(
            entry("a.yml", AuditStatus::Success).with_metadata("application_id", "abc-123"),
        );
        let hits = journal.query_by_resource("a.yml");
        assert_eq!(hits[0].metadata["application_id"], "abc-123");
    }
}
