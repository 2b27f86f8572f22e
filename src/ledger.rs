use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::{FileLock, unix_now, validate_task_id, write_atomic};

/// Kinds of outward-facing effect the loop applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Approve,
    LimitReached,
    Stuck,
    RepairRequested,
    Failed,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Approve => "approve",
            ActionKind::LimitReached => "limit-reached",
            ActionKind::Stuck => "stuck",
            ActionKind::RepairRequested => "repair-requested",
            ActionKind::Failed => "failed",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one effect: `(task, kind, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId {
    pub task_id: String,
    pub kind: ActionKind,
    pub key: String,
}

impl ActionId {
    pub fn new(task_id: impl Into<String>, kind: ActionKind, key: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            key: key.into(),
        }
    }

    pub fn for_iteration(task_id: impl Into<String>, kind: ActionKind, iteration: u32) -> Self {
        Self::new(task_id, kind, format!("iteration-{iteration}"))
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.task_id, self.kind, self.key)
    }
}

/// Result of a successfully applied effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub applied_at: u64,
}

impl Outcome {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            reference: None,
            applied_at: unix_now(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// How long a claim on an action blocks other workers before it is considered abandoned.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

/// Answer to [`ActionLedger::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now holds the action and must `record` or `release` it.
    Granted,
    /// The action was already applied.
    Applied(Outcome),
    /// Another worker holds a live claim.
    Held,
}

/// Persistent mapping from [`ActionId`] to the outcome it produced.
///
/// `claim` is atomic across every handle on the same ledger, so one action has at most one
/// worker applying it at a time.
pub trait ActionLedger: Send + Sync {
    fn get(&self, id: &ActionId) -> Result<Option<Outcome>>;
    fn claim(&self, id: &ActionId, lease: Duration) -> Result<Claim>;
    /// Store the outcome, replacing any claim.
    fn record(&self, id: &ActionId, outcome: &Outcome) -> Result<()>;
    /// Drop a claim that never produced an outcome.
    fn release(&self, id: &ActionId) -> Result<()>;
    fn clear_task(&self, task_id: &str) -> Result<()>;
}

fn claim_is_live(claimed_at: u64, lease: Duration, now: u64) -> bool {
    claimed_at.saturating_add(lease.as_secs()) > now
}

#[derive(Debug, Clone)]
enum Entry {
    Claimed(u64),
    Applied(Outcome),
}

#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<ActionId, Entry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ActionId, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Store("memory ledger lock poisoned".to_string()))
    }
}

impl ActionLedger for MemoryLedger {
    fn get(&self, id: &ActionId) -> Result<Option<Outcome>> {
        Ok(match self.entries()?.get(id) {
            Some(Entry::Applied(outcome)) => Some(outcome.clone()),
            _ => None,
        })
    }

    fn claim(&self, id: &ActionId, lease: Duration) -> Result<Claim> {
        let mut entries = self.entries()?;
        let now = unix_now();
        match entries.get(id) {
            Some(Entry::Applied(outcome)) => return Ok(Claim::Applied(outcome.clone())),
            Some(Entry::Claimed(at)) if claim_is_live(*at, lease, now) => return Ok(Claim::Held),
            _ => {}
        }
        entries.insert(id.clone(), Entry::Claimed(now));
        Ok(Claim::Granted)
    }

    fn record(&self, id: &ActionId, outcome: &Outcome) -> Result<()> {
        self.entries()?
            .insert(id.clone(), Entry::Applied(outcome.clone()));
        Ok(())
    }

    fn release(&self, id: &ActionId) -> Result<()> {
        let mut entries = self.entries()?;
        if matches!(entries.get(id), Some(Entry::Claimed(_))) {
            entries.remove(id);
        }
        Ok(())
    }

    fn clear_task(&self, task_id: &str) -> Result<()> {
        self.entries()?.retain(|id, _| id.task_id != task_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionRecord {
    kind: ActionKind,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome: Option<Outcome>,
}

impl ActionRecord {
    fn is(&self, id: &ActionId) -> bool {
        self.kind == id.kind && self.key == id.key
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskLedger {
    #[serde(default)]
    actions: Vec<ActionRecord>,
}

/// One TOML file of applied actions per task under `<state_dir>/ledger/`.
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into().join("ledger"),
        }
    }

    fn ledger_file(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.toml"))
    }

    fn lock(&self, task_id: &str) -> Result<FileLock> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Store(format!("failed to create ledger dir: {e}")))?;
        FileLock::acquire(&self.dir.join(format!("{task_id}.lock")))
    }

    fn read(&self, task_id: &str) -> Result<TaskLedger> {
        let path = self.ledger_file(task_id);
        match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                Error::Store(format!("corrupted ledger file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TaskLedger::default()),
            Err(e) => Err(Error::Store(format!(
                "failed to read ledger file {}: {e}",
                path.display()
            ))),
        }
    }
}

impl FileLedger {
    fn write(&self, task_id: &str, ledger: &TaskLedger) -> Result<()> {
        let content = toml::to_string_pretty(ledger)
            .map_err(|e| Error::Store(format!("failed to serialize ledger: {e}")))?;
        write_atomic(&self.ledger_file(task_id), &content)
    }
}

impl ActionLedger for FileLedger {
    fn get(&self, id: &ActionId) -> Result<Option<Outcome>> {
        validate_task_id(&id.task_id)?;
        Ok(self
            .read(&id.task_id)?
            .actions
            .into_iter()
            .find(|a| a.is(id))
            .and_then(|a| a.outcome))
    }

    fn claim(&self, id: &ActionId, lease: Duration) -> Result<Claim> {
        validate_task_id(&id.task_id)?;
        let _lock = self.lock(&id.task_id)?;
        let mut ledger = self.read(&id.task_id)?;
        let now = unix_now();
        if let Some(existing) = ledger.actions.iter().find(|a| a.is(id)) {
            if let Some(ref outcome) = existing.outcome {
                return Ok(Claim::Applied(outcome.clone()));
            }
            if let Some(at) = existing.claimed_at
                && claim_is_live(at, lease, now)
            {
                return Ok(Claim::Held);
            }
        }
        ledger.actions.retain(|a| !a.is(id));
        ledger.actions.push(ActionRecord {
            kind: id.kind,
            key: id.key.clone(),
            claimed_at: Some(now),
            outcome: None,
        });
        self.write(&id.task_id, &ledger)?;
        Ok(Claim::Granted)
    }

    fn record(&self, id: &ActionId, outcome: &Outcome) -> Result<()> {
        validate_task_id(&id.task_id)?;
        let _lock = self.lock(&id.task_id)?;
        let mut ledger = self.read(&id.task_id)?;
        ledger.actions.retain(|a| !a.is(id));
        ledger.actions.push(ActionRecord {
            kind: id.kind,
            key: id.key.clone(),
            claimed_at: None,
            outcome: Some(outcome.clone()),
        });
        self.write(&id.task_id, &ledger)
    }

    fn release(&self, id: &ActionId) -> Result<()> {
        validate_task_id(&id.task_id)?;
        let _lock = self.lock(&id.task_id)?;
        let mut ledger = self.read(&id.task_id)?;
        let before = ledger.actions.len();
        ledger.actions.retain(|a| !(a.is(id) && a.outcome.is_none()));
        if ledger.actions.len() == before {
            return Ok(());
        }
        self.write(&id.task_id, &ledger)
    }

    fn clear_task(&self, task_id: &str) -> Result<()> {
        validate_task_id(task_id)?;
        let _lock = self.lock(task_id)?;
        match fs::remove_file(self.ledger_file(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("failed to clear ledger: {e}"))),
        }
    }
}

/// What [`IdempotencyLayer::apply_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The effect ran and its outcome was recorded.
    Fresh(Outcome),
    /// The effect had already run; its recorded outcome is returned.
    Replayed(Outcome),
    /// Another worker is applying the effect right now.
    InFlight,
}

/// Runs each effect at most once per [`ActionId`].
///
/// Effects for the same task are serialized within a process. Across processes the ledger
/// claim keeps a second worker from running an effect that is still in flight.
pub struct IdempotencyLayer {
    ledger: Arc<dyn ActionLedger>,
    lease: Duration,
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdempotencyLayer {
    pub fn new(ledger: Arc<dyn ActionLedger>) -> Self {
        Self {
            ledger,
            lease: DEFAULT_CLAIM_LEASE,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn task_lock(&self, task_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .task_locks
            .lock()
            .map_err(|_| Error::Store("idempotency lock table poisoned".to_string()))?;
        Ok(locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Run `effect` unless `id` already has a recorded outcome or a live claim.
    ///
    /// Only successful outcomes are recorded. A failed effect gives up its claim, so it runs
    /// again on the next call.
    pub async fn apply_once<F, Fut>(&self, id: &ActionId, effect: F) -> Result<Applied>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Outcome>>,
    {
        let lock = self.task_lock(&id.task_id)?;
        let _guard = lock.lock().await;

        match self.ledger.claim(id, self.lease)? {
            Claim::Applied(outcome) => {
                debug!(action = %id, "effect already applied, replaying outcome");
                return Ok(Applied::Replayed(outcome));
            }
            Claim::Held => {
                debug!(action = %id, "effect in flight in another worker");
                return Ok(Applied::InFlight);
            }
            Claim::Granted => {}
        }

        match effect().await {
            Ok(outcome) => {
                self.ledger.record(id, &outcome)?;
                info!(action = %id, summary = %outcome.summary, "effect applied");
                Ok(Applied::Fresh(outcome))
            }
            Err(e) => {
                if let Err(release) = self.ledger.release(id) {
                    warn!(action = %id, error = %release, "could not release action claim");
                }
                Err(e)
            }
        }
    }

    /// Forget every recorded action of a task.
    pub async fn clear(&self, task_id: &str) -> Result<()> {
        let lock = self.task_lock(task_id)?;
        let _guard = lock.lock().await;
        self.ledger.clear_task(task_id)
    }
}
