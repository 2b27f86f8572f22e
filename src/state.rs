use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::finding::FindingSnapshot;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Approved,
    MaxIterationsReached,
    Stuck,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses only change through an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Approved
                | TaskStatus::MaxIterationsReached
                | TaskStatus::Stuck
                | TaskStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Approved => "approved",
            TaskStatus::MaxIterationsReached => "max_iterations_reached",
            TaskStatus::Stuck => "stuck",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-task loop state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub task_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Bumped by every commit; the compare-and-swap key.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub history: Vec<FindingSnapshot>,
}

impl IterationRecord {
    pub fn new(task_id: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            task_id: task_id.into(),
            iteration: 0,
            max_iterations,
            status: TaskStatus::Pending,
            last_error: None,
            revision: 0,
            updated_at: 0,
            history: Vec::new(),
        }
    }

    /// Whether a round triggered by `key` has already been committed.
    pub fn has_trigger(&self, key: &str) -> bool {
        self.history.iter().any(|s| s.trigger_key == key)
    }

    /// Whether a round later than `iteration` was committed for `key`.
    pub fn has_trigger_after(&self, key: &str, iteration: u32) -> bool {
        self.history
            .iter()
            .any(|s| s.iteration > iteration && s.trigger_key == key)
    }

    pub fn latest(&self) -> Option<&FindingSnapshot> {
        self.history.last()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Task ids become file names, so only a conservative character set is accepted.
pub fn validate_task_id(task_id: &str) -> Result<()> {
    let valid = !task_id.is_empty()
        && task_id.len() <= 128
        && !task_id.starts_with('.')
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::TaskId(task_id.to_string()))
    }
}

/// Keyed store of [`IterationRecord`]s with optimistic concurrency.
pub trait IterationStore: Send + Sync {
    /// Load the committed record, or a fresh `Pending` one if the task is unknown.
    fn load(&self, task_id: &str) -> Result<IterationRecord>;

    /// Persist `record` if the stored revision still equals `record.revision`.
    ///
    /// Returns the committed record with its revision bumped, or [`Error::Conflict`] when
    /// another writer committed first.
    fn commit(&self, record: IterationRecord) -> Result<IterationRecord>;

    /// Replace the record with a fresh `Pending` one, keeping its iteration budget.
    fn reset(&self, task_id: &str) -> Result<IterationRecord>;
}

fn check_revision(task_id: &str, expected: u64, found: u64) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        debug!(task_id, expected, found, "revision mismatch");
        Err(Error::Conflict {
            task_id: task_id.to_string(),
            expected,
            found,
        })
    }
}

fn advance(mut record: IterationRecord) -> IterationRecord {
    record.revision += 1;
    record.updated_at = unix_now();
    record
}

fn fresh_from(current: &IterationRecord) -> IterationRecord {
    let mut fresh = IterationRecord::new(current.task_id.clone(), current.max_iterations);
    fresh.revision = current.revision;
    advance(fresh)
}

/// Process-local store, used by tests and dry runs.
pub struct MemoryStore {
    max_iterations: u32,
    records: Mutex<HashMap<String, IterationRecord>>,
}

impl MemoryStore {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, IterationRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl IterationStore for MemoryStore {
    fn load(&self, task_id: &str) -> Result<IterationRecord> {
        validate_task_id(task_id)?;
        Ok(self
            .records()?
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| IterationRecord::new(task_id, self.max_iterations)))
    }

    fn commit(&self, record: IterationRecord) -> Result<IterationRecord> {
        validate_task_id(&record.task_id)?;
        let mut records = self.records()?;
        let found = records.get(&record.task_id).map_or(0, |r| r.revision);
        check_revision(&record.task_id, record.revision, found)?;
        let committed = advance(record);
        records.insert(committed.task_id.clone(), committed.clone());
        Ok(committed)
    }

    fn reset(&self, task_id: &str) -> Result<IterationRecord> {
        validate_task_id(task_id)?;
        let mut records = self.records()?;
        let current = records
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| IterationRecord::new(task_id, self.max_iterations));
        let fresh = fresh_from(&current);
        records.insert(task_id.to_string(), fresh.clone());
        Ok(fresh)
    }
}

/// Exclusive advisory lock held until dropped.
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Store(format!("failed to open lock {}: {e}", path.display())))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        return Err(Error::Store(format!(
                            "timed out waiting for lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => {
                    return Err(Error::Store(format!(
                        "failed to lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Write via a temp file and rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp_path.display())))?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::Store(format!(
            "failed to replace {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

/// Records persisted as one TOML file per task under `<state_dir>/tasks/`.
pub struct FileStore {
    state_dir: PathBuf,
    max_iterations: u32,
}

impl FileStore {
    pub fn new(state_dir: impl Into<PathBuf>, max_iterations: u32) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_iterations,
        }
    }

    /// Default state directory relative to a repo root.
    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".reviewloop").join("state")
    }

    fn tasks_dir(&self) -> PathBuf {
        self.state_dir.join("tasks")
    }

    fn record_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.toml"))
    }

    fn lock(&self, task_id: &str) -> Result<FileLock> {
        let dir = self.tasks_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Store(format!("failed to create state dir: {e}")))?;
        FileLock::acquire(&dir.join(format!("{task_id}.lock")))
    }

    /// Read the stored record without taking the lock.
    fn read(&self, task_id: &str) -> Result<Option<IterationRecord>> {
        let path = self.record_file(task_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Store(format!(
                    "failed to read state file {}: {e}",
                    path.display()
                )));
            }
        };
        // A corrupt record is an error: silently starting over would reset the iteration budget.
        toml::from_str(&content).map(Some).map_err(|e| {
            Error::Store(format!("corrupted state file {}: {e}", path.display()))
        })
    }

    fn write(&self, record: &IterationRecord) -> Result<()> {
        let content = toml::to_string_pretty(record)
            .map_err(|e| Error::Store(format!("failed to serialize state: {e}")))?;
        write_atomic(&self.record_file(&record.task_id), &content)
    }
}

impl IterationStore for FileStore {
    fn load(&self, task_id: &str) -> Result<IterationRecord> {
        validate_task_id(task_id)?;
        Ok(self
            .read(task_id)?
            .unwrap_or_else(|| IterationRecord::new(task_id, self.max_iterations)))
    }

    fn commit(&self, record: IterationRecord) -> Result<IterationRecord> {
        validate_task_id(&record.task_id)?;
        let _lock = self.lock(&record.task_id)?;
        let found = self.read(&record.task_id)?.map_or(0, |r| r.revision);
        check_revision(&record.task_id, record.revision, found)?;
        let committed = advance(record);
        self.write(&committed)?;
        Ok(committed)
    }

    fn reset(&self, task_id: &str) -> Result<IterationRecord> {
        validate_task_id(task_id)?;
        let _lock = self.lock(task_id)?;
        // Reset must also recover from a corrupted record.
        let current = self
            .read(task_id)
            .ok()
            .flatten()
            .unwrap_or_else(|| IterationRecord::new(task_id, self.max_iterations));
        let fresh = fresh_from(&current);
        self.write(&fresh)?;
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::{Decision, Finding, Severity};
    use tempfile::TempDir;

    fn test_store() -> (TempDir, FileStore) {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("state"), 5);
        (tmp, store)
    }

    fn snapshot(iteration: u32) -> FindingSnapshot {
        FindingSnapshot {
            iteration,
            decision: Decision::RequestChanges,
            timestamp: 1,
            trigger_key: format!("delivery-{iteration}"),
            findings: vec![Finding::new("tests", Severity::Blocking, "boom", None)],
        }
    }

    fn stores() -> Vec<(Option<TempDir>, Box<dyn IterationStore>)> {
        let (tmp, file) = test_store();
        vec![
            (None, Box::new(MemoryStore::new(5))),
            (Some(tmp), Box::new(file)),
        ]
    }

    #[test]
    fn test_load_unknown_task_is_fresh_pending() {
        for (_tmp, store) in stores() {
            let record = store.load("gh-1").unwrap();
            assert_eq!(record, IterationRecord::new("gh-1", 5));
        }
    }

    #[test]
    fn test_commit_bumps_revision_and_persists() {
        for (_tmp, store) in stores() {
            let mut record = store.load("gh-1").unwrap();
            record.iteration = 1;
            record.status = TaskStatus::InProgress;
            record.history.push(snapshot(1));
            let committed = store.commit(record).unwrap();
            assert_eq!(committed.revision, 1);

            let loaded = store.load("gh-1").unwrap();
            assert_eq!(loaded, committed);
        }
    }

    #[test]
    fn test_stale_commit_conflicts() {
        for (_tmp, store) in stores() {
            let a = store.load("gh-1").unwrap();
            let b = store.load("gh-1").unwrap();
            store.commit(a).unwrap();
            let err = store.commit(b).unwrap_err();
            assert!(matches!(
                err,
                Error::Conflict {
                    expected: 0,
                    found: 1,
                    ..
                }
            ));
            assert_eq!(store.load("gh-1").unwrap().revision, 1);
        }
    }

    #[test]
    fn test_reset_clears_history_and_invalidates_inflight() {
        for (_tmp, store) in stores() {
            let mut record = store.load("gh-1").unwrap();
            record.iteration = 3;
            record.status = TaskStatus::Stuck;
            record.last_error = Some("x".to_string());
            record.history.push(snapshot(1));
            let committed = store.commit(record).unwrap();

            let fresh = store.reset("gh-1").unwrap();
            assert_eq!(fresh.iteration, 0);
            assert_eq!(fresh.status, TaskStatus::Pending);
            assert!(fresh.history.is_empty());
            assert!(fresh.last_error.is_none());
            assert_eq!(fresh.revision, committed.revision + 1);

            assert!(store.commit(committed).is_err());
        }
    }

    #[test]
    fn test_trigger_lookup_by_round() {
        let mut record = IterationRecord::new("gh-1", 5);
        let mut first = snapshot(1);
        first.trigger_key = "abc".to_string();
        record.history = vec![first, snapshot(2)];
        record.iteration = 2;

        assert!(record.has_trigger("abc"));
        assert!(record.has_trigger_after("abc", 0));
        assert!(!record.has_trigger_after("abc", 1));
        assert!(record.has_trigger_after("delivery-2", 1));
        assert!(!record.has_trigger_after("delivery-2", 2));
    }

    #[test]
    fn test_invalid_task_id_rejected() {
        for (_tmp, store) in stores() {
            assert!(matches!(store.load("../etc"), Err(Error::TaskId(_))));
            assert!(matches!(store.load(""), Err(Error::TaskId(_))));
        }
    }

    #[test]
    fn test_file_store_corrupt_record_is_error() {
        let (_tmp, store) = test_store();
        fs::create_dir_all(store.tasks_dir()).unwrap();
        fs::write(store.record_file("gh-1"), "not valid {{{{ toml").unwrap();
        assert!(matches!(store.load("gh-1"), Err(Error::Store(_))));

        let fresh = store.reset("gh-1").unwrap();
        assert_eq!(fresh.status, TaskStatus::Pending);
        assert_eq!(store.load("gh-1").unwrap(), fresh);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("state");
        let committed = {
            let store = FileStore::new(&dir, 5);
            let mut record = store.load("gh-9").unwrap();
            record.history.push(snapshot(1));
            store.commit(record).unwrap()
        };
        let reopened = FileStore::new(&dir, 5);
        assert_eq!(reopened.load("gh-9").unwrap(), committed);
    }

    #[test]
    fn test_default_dir() {
        let dir = FileStore::default_dir(Path::new("/repo"));
        assert_eq!(dir, PathBuf::from("/repo/.reviewloop/state"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Approved.is_terminal());
        assert!(TaskStatus::MaxIterationsReached.is_terminal());
        assert!(TaskStatus::Stuck.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
