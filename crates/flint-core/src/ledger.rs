//! Append-only record of every recorded run.
//!
//! The ledger is a JSONL file of `begin` and `complete` events. Lines are only
//! ever appended, each with a single write, so processes sharing a ledger do
//! not interleave partial lines. A run that was killed keeps its `begin` event
//! without a `complete` and reads back as `running` forever.

use crate::snapshot::SnapshotId;
use crate::{sha256_bytes, Error, Mode, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEvent {
    Begin {
        run_id: String,
        experiment: String,
        snapshot: SnapshotId,
        artifact_dir: PathBuf,
        mode: Mode,
        started_at: DateTime<Utc>,
        pid: u32,
    },
    Complete {
        run_id: String,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub experiment: String,
    pub snapshot: SnapshotId,
    pub artifact_dir: PathBuf,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct RunLedger {
    path: PathBuf,
    experiment: String,
}

impl RunLedger {
    pub fn open(path: impl Into<PathBuf>, experiment: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            experiment: experiment.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the start of a run. Must happen before any skeleton step.
    pub fn begin(&self, snapshot: &SnapshotId, artifact_dir: &Path, mode: Mode) -> Result<RunGuard> {
        let taken: HashSet<String> = self.records()?.into_iter().map(|r| r.run_id).collect();
        let run_id = new_run_id(&taken);
        self.append(&LedgerEvent::Begin {
            run_id: run_id.clone(),
            experiment: self.experiment.clone(),
            snapshot: snapshot.clone(),
            artifact_dir: artifact_dir.to_path_buf(),
            mode,
            started_at: Utc::now(),
            pid: std::process::id(),
        })?;
        info!(run_id = %run_id, snapshot = %snapshot.short(), mode = %mode, "run started");
        Ok(RunGuard {
            ledger: self.clone(),
            run_id,
            done: false,
        })
    }

    /// Record the outcome of `run_id`. A run can be completed once.
    pub fn complete(&self, run_id: &str, status: RunStatus, error: Option<String>) -> Result<()> {
        if status == RunStatus::Running {
            return Err(Error::ledger("a run cannot complete with status running"));
        }
        let record = self
            .record(run_id)?
            .ok_or_else(|| Error::ledger(format!("unknown run {}", run_id)))?;
        if record.status != RunStatus::Running {
            return Err(Error::ledger(format!(
                "run {} already completed with status {}",
                run_id, record.status
            )));
        }
        self.append(&LedgerEvent::Complete {
            run_id: run_id.to_string(),
            status,
            finished_at: Utc::now(),
            error: error.clone(),
        })?;
        match error {
            Some(err) => warn!(run_id = %run_id, status = %status, error = %err, "run finished"),
            None => info!(run_id = %run_id, status = %status, "run finished"),
        }
        Ok(())
    }

    /// All runs in the order they began.
    pub fn records(&self) -> Result<Vec<RunRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::ledger(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let mut order: Vec<String> = Vec::new();
        let mut by_id: BTreeMap<String, RunRecord> = BTreeMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: LedgerEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(ledger = %self.path.display(), line = lineno + 1, error = %e, "skipping unreadable ledger line");
                    continue;
                }
            };
            match event {
                LedgerEvent::Begin {
                    run_id,
                    experiment,
                    snapshot,
                    artifact_dir,
                    mode,
                    started_at,
                    pid,
                } => {
                    order.push(run_id.clone());
                    by_id.insert(
                        run_id.clone(),
                        RunRecord {
                            run_id,
                            experiment,
                            snapshot,
                            artifact_dir,
                            mode,
                            started_at,
                            finished_at: None,
                            status: RunStatus::Running,
                            error: None,
                            pid,
                        },
                    );
                }
                LedgerEvent::Complete {
                    run_id,
                    status,
                    finished_at,
                    error,
                } => {
                    // First completion wins; the writer never emits a second one.
                    if let Some(record) = by_id.get_mut(&run_id) {
                        if record.status == RunStatus::Running {
                            record.status = status;
                            record.finished_at = Some(finished_at);
                            record.error = error;
                        }
                    }
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect())
    }

    pub fn record(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.records()?.into_iter().find(|r| r.run_id == run_id))
    }

    fn append(&self, event: &LedgerEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| Error::ledger(format!("cannot encode event: {}", e)))?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            crate::ensure_dir(parent).map_err(|e| {
                Error::ledger(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::ledger(format!("cannot open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| Error::ledger(format!("cannot append to {}: {}", self.path.display(), e)))
    }
}

/// Scoped ownership of an open ledger entry.
///
/// Dropping the guard without calling `complete` records the run as failed,
/// so early returns and panics still close the entry.
#[derive(Debug)]
pub struct RunGuard {
    ledger: RunLedger,
    run_id: String,
    done: bool,
}

impl RunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn complete(&mut self, status: RunStatus, error: Option<String>) -> Result<()> {
        if self.done {
            return Err(Error::ledger(format!("run {} already completed", self.run_id)));
        }
        self.ledger.complete(&self.run_id, status, error)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            let _ = self
                .ledger
                .complete(&self.run_id, RunStatus::Failed, Some("aborted".to_string()));
        }
    }
}

/// `run_<utc timestamp>_<5 letters>`, unique among `taken`.
fn new_run_id(taken: &HashSet<String>) -> String {
    let stamp = Utc::now();
    let mut attempt: u64 = 0;
    loop {
        let seed = format!(
            "{}:{}:{}",
            std::process::id(),
            stamp.timestamp_nanos_opt().unwrap_or_default(),
            attempt
        );
        let candidate = format!(
            "run_{}_{}",
            stamp.format("%Y%m%d_%H%M%S"),
            base26_tag(&sha256_bytes(seed.as_bytes()))
        );
        if !taken.contains(&candidate) {
            return candidate;
        }
        attempt += 1;
    }
}

fn base26_tag(digest_hex: &str) -> String {
    let mut number = u64::from_str_radix(&digest_hex[..12], 16).unwrap_or(0) % 26u64.pow(5);
    let mut letters = [b'a'; 5];
    for slot in letters.iter_mut().rev() {
        *slot = b'a' + (number % 26) as u8;
        number /= 26;
    }
    String::from_utf8_lossy(&letters).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_root;

    fn sid(c: char) -> SnapshotId {
        SnapshotId::parse(&c.to_string().repeat(40)).expect("id")
    }

    #[test]
    fn begin_then_complete_yields_one_finished_record() {
        let root = temp_root("ledger_ok");
        let ledger = RunLedger::open(root.join("ledger.jsonl"), "exp");
        let mut guard = ledger
            .begin(&sid('a'), &root.join("artifacts"), Mode::Train)
            .expect("begin");
        let run_id = guard.run_id().to_string();
        assert_eq!(
            ledger.record(&run_id).expect("read").expect("present").status,
            RunStatus::Running
        );
        guard.complete(RunStatus::Success, None).expect("complete");
        drop(guard);

        let records = ledger.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Success);
        assert_eq!(records[0].mode, Mode::Train);
        assert!(records[0].finished_at.is_some());
        let lines = fs::read_to_string(ledger.path()).expect("read").lines().count();
        assert_eq!(lines, 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dropped_guard_records_failure_once() {
        let root = temp_root("ledger_drop");
        let ledger = RunLedger::open(root.join("ledger.jsonl"), "exp");
        let run_id = {
            let guard = ledger
                .begin(&sid('b'), &root.join("artifacts"), Mode::Test)
                .expect("begin");
            guard.run_id().to_string()
        };
        let record = ledger.record(&run_id).expect("read").expect("present");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("aborted"));
        let err = ledger
            .complete(&run_id, RunStatus::Success, None)
            .expect_err("second completion");
        assert!(err.to_string().contains("already completed"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn guard_refuses_double_complete() {
        let root = temp_root("ledger_double");
        let ledger = RunLedger::open(root.join("ledger.jsonl"), "exp");
        let mut guard = ledger
            .begin(&sid('c'), &root.join("artifacts"), Mode::Eval)
            .expect("begin");
        guard
            .complete(RunStatus::Failed, Some("boom".to_string()))
            .expect("first");
        assert!(guard.complete(RunStatus::Success, None).is_err());
        drop(guard);
        let records = ledger.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error.as_deref(), Some("boom"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unfinished_runs_stay_running_and_order_is_kept() {
        let root = temp_root("ledger_order");
        let ledger = RunLedger::open(root.join("ledger.jsonl"), "exp");
        let mut first = ledger
            .begin(&sid('a'), &root.join("a"), Mode::Train)
            .expect("begin");
        let second = ledger
            .begin(&sid('b'), &root.join("b"), Mode::Train)
            .expect("begin");
        first.complete(RunStatus::Success, None).expect("complete");
        let second_id = second.run_id().to_string();
        std::mem::forget(second);

        let records = ledger.records().expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].snapshot, sid('a'));
        assert_eq!(records[1].run_id, second_id);
        assert_eq!(records[1].status, RunStatus::Running);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_completion_leaves_the_guard_open() {
        let root = temp_root("ledger_retry");
        let path = root.join("ledger.jsonl");
        let ledger = RunLedger::open(&path, "exp");
        let mut guard = ledger
            .begin(&sid('d'), &root.join("artifacts"), Mode::Train)
            .expect("begin");

        let aside = root.join("ledger.aside");
        fs::rename(&path, &aside).expect("move ledger away");
        fs::create_dir(&path).expect("block ledger path");
        assert!(guard.complete(RunStatus::Success, None).is_err());
        fs::remove_dir(&path).expect("unblock");
        fs::rename(&aside, &path).expect("restore ledger");

        guard.complete(RunStatus::Success, None).expect("retry");
        drop(guard);
        let records = ledger.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Success);
        assert_eq!(fs::read_to_string(&path).expect("read").lines().count(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_snapshot_ids_are_skipped_like_other_bad_lines() {
        let root = temp_root("ledger_bad_id");
        let ledger = RunLedger::open(root.join("ledger.jsonl"), "exp");
        let mut guard = ledger
            .begin(&sid('e'), &root.join("artifacts"), Mode::Eval)
            .expect("begin");
        guard.complete(RunStatus::Success, None).expect("complete");
        let bad = serde_json::json!({
            "event": "begin",
            "run_id": "run_bad",
            "experiment": "exp",
            "snapshot": "abc",
            "artifact_dir": root.join("x"),
            "mode": "train",
            "started_at": Utc::now(),
            "pid": 1,
        });
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(ledger.path())
            .expect("open");
        writeln!(file, "{}", bad).expect("append");

        let records = ledger.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].snapshot.short(), "eeeeeeeeeeee");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_ids_avoid_taken_names() {
        let mut taken = HashSet::new();
        for _ in 0..50 {
            let id = new_run_id(&taken);
            assert!(id.starts_with("run_"));
            assert!(taken.insert(id));
        }
    }
}
