use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::{Classification, FindingClassifier};
use crate::error::{Error, Result};
use crate::finding::{Decision, Finding, FindingSnapshot, fingerprint};
use crate::generator::{ChangeSet, GeneratorClient, RepairRequest};
use crate::ledger::{ActionId, ActionKind, ActionLedger, IdempotencyLayer};
use crate::rate_limit::RateLimiter;
use crate::report::ParserRegistry;
use crate::review::{ReviewClient, ReviewOutcome};
use crate::state::{IterationRecord, IterationStore, TaskStatus, unix_now, validate_task_id};
use crate::stuck::{DEFAULT_SIMILARITY_THRESHOLD, StuckDetector};

/// New check results for one task.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub task_id: String,
    /// Identity of the delivery; redeliveries carry the same id.
    pub delivery_id: Option<String>,
    /// Raw report text keyed by check source name.
    pub reports: BTreeMap<String, String>,
}

impl Trigger {
    pub fn new(task_id: impl Into<String>, reports: BTreeMap<String, String>) -> Self {
        Self {
            task_id: task_id.into(),
            delivery_id: None,
            reports,
        }
    }

    pub fn with_delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }
}

/// How a trigger is recognized when it is delivered again.
#[derive(Debug, Clone)]
enum TriggerKey {
    /// Matches any earlier round with the same delivery id.
    Delivery(String),
    /// Fingerprint of the classified findings; matches only rounds committed after the
    /// trigger first saw the record.
    Findings(String),
}

impl TriggerKey {
    fn as_str(&self) -> &str {
        match self {
            TriggerKey::Delivery(key) | TriggerKey::Findings(key) => key,
        }
    }
}

/// What a trigger led to.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Approved { iteration: u32 },
    RepairRequested { iteration: u32, change_set: ChangeSet },
    MaxIterationsReached { iteration: u32 },
    Stuck { iteration: u32, mean_similarity: f64 },
    Failed { iteration: u32, error: String },
    /// The task is in a terminal status; nothing changed.
    Ignored { status: TaskStatus },
    /// This trigger was already processed; nothing changed.
    Duplicate { iteration: u32, status: TaskStatus },
}

impl DecisionOutcome {
    /// Status the task is in after this outcome.
    pub fn status(&self) -> TaskStatus {
        match self {
            DecisionOutcome::Approved { .. } => TaskStatus::Approved,
            DecisionOutcome::RepairRequested { .. } => TaskStatus::InProgress,
            DecisionOutcome::MaxIterationsReached { .. } => TaskStatus::MaxIterationsReached,
            DecisionOutcome::Stuck { .. } => TaskStatus::Stuck,
            DecisionOutcome::Failed { .. } => TaskStatus::Failed,
            DecisionOutcome::Ignored { status } | DecisionOutcome::Duplicate { status, .. } => {
                *status
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub similarity_threshold: f64,
    pub min_coverage_percent: Option<f64>,
    pub generator_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            min_coverage_percent: None,
            generator_timeout: Duration::from_secs(1800),
        }
    }
}

/// Decides, per trigger, whether to approve, halt, or request another repair.
pub struct LoopController<G, R> {
    store: Arc<dyn IterationStore>,
    idempotency: IdempotencyLayer,
    classifier: FindingClassifier,
    detector: StuckDetector,
    limiter: RateLimiter,
    generator: G,
    reviewer: R,
    generator_timeout: Duration,
}

impl<G: GeneratorClient, R: ReviewClient> LoopController<G, R> {
    pub fn new(
        store: Arc<dyn IterationStore>,
        ledger: Arc<dyn ActionLedger>,
        limiter: RateLimiter,
        generator: G,
        reviewer: R,
        settings: LoopSettings,
    ) -> Self {
        Self {
            store,
            idempotency: IdempotencyLayer::new(ledger),
            classifier: FindingClassifier::new(settings.min_coverage_percent),
            detector: StuckDetector::new(settings.similarity_threshold),
            limiter,
            generator,
            reviewer,
            generator_timeout: settings.generator_timeout,
        }
    }

    /// Replace the report parsers, keeping the coverage threshold.
    pub fn with_parsers(mut self, parsers: ParserRegistry, min_coverage_percent: Option<f64>) -> Self {
        self.classifier = FindingClassifier::with_parsers(parsers, min_coverage_percent);
        self
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn reviewer(&self) -> &R {
        &self.reviewer
    }

    /// Last committed record for a task.
    pub fn status(&self, task_id: &str) -> Result<IterationRecord> {
        self.store.load(task_id)
    }

    /// Return a task to `Pending` with an empty history and forget its applied actions.
    pub async fn reset(&self, task_id: &str) -> Result<IterationRecord> {
        let fresh = self.store.reset(task_id)?;
        self.idempotency.clear(task_id).await?;
        info!(task_id, revision = fresh.revision, "task reset");
        Ok(fresh)
    }

    /// Process one trigger.
    ///
    /// Returns [`Error::RateLimitExceeded`] without committing anything when no generator slot
    /// is available. Generator and publishing failures are committed as `Failed` and reported
    /// through [`DecisionOutcome::Failed`].
    pub async fn on_trigger(&self, trigger: &Trigger) -> Result<DecisionOutcome> {
        validate_task_id(&trigger.task_id)?;
        let classification = self.classifier.classify(&trigger.reports);
        let key = match trigger.delivery_id {
            Some(ref id) => TriggerKey::Delivery(id.clone()),
            None => TriggerKey::Findings(fingerprint(&classification.findings)),
        };

        let mut first_seen = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .decide(&trigger.task_id, &classification, &key, &mut first_seen)
                .await
            {
                Err(Error::Conflict {
                    expected, found, ..
                }) => {
                    debug!(
                        task_id = %trigger.task_id,
                        attempt,
                        expected,
                        found,
                        "lost commit race, retrying decision"
                    );
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    async fn decide(
        &self,
        task_id: &str,
        classification: &Classification,
        key: &TriggerKey,
        first_seen: &mut Option<u32>,
    ) -> Result<DecisionOutcome> {
        let record = self.store.load(task_id)?;
        let seen = *first_seen.get_or_insert(record.iteration);

        let duplicate = match key {
            TriggerKey::Delivery(id) => record.has_trigger(id),
            // Identical findings in a later round are a new round, not a redelivery.
            TriggerKey::Findings(fp) => record.has_trigger_after(fp, seen),
        };
        if duplicate {
            debug!(task_id, key = key.as_str(), "duplicate trigger");
            if record.status.is_terminal() {
                self.settle_terminal(&record).await;
            }
            return Ok(DecisionOutcome::Duplicate {
                iteration: record.iteration,
                status: record.status,
            });
        }
        if record.status.is_terminal() {
            info!(task_id, status = %record.status, "task is terminal, ignoring trigger");
            self.settle_terminal(&record).await;
            return Ok(DecisionOutcome::Ignored {
                status: record.status,
            });
        }

        let round = record.iteration + 1;
        let findings = classification.findings.clone();
        let decision = Decision::for_findings(&findings);
        let blocking: Vec<Finding> = findings.iter().filter(|f| f.is_blocking()).cloned().collect();

        let mut trial = record.clone();
        trial.history.push(FindingSnapshot {
            iteration: round,
            decision,
            timestamp: unix_now(),
            trigger_key: key.as_str().to_string(),
            findings,
        });
        trial.iteration = round;

        if decision == Decision::Approve {
            trial.status = TaskStatus::Approved;
            trial.last_error = None;
            let committed = self.store.commit(trial)?;
            info!(task_id, iteration = round, "approved");
            if let Err(e) = self
                .publish(&committed, ActionKind::Approve, blocking, None)
                .await
            {
                return self.fail(committed, e).await;
            }
            return Ok(DecisionOutcome::Approved { iteration: round });
        }

        if round >= record.max_iterations {
            trial.status = TaskStatus::MaxIterationsReached;
            let committed = self.store.commit(trial)?;
            info!(
                task_id,
                iteration = round,
                max_iterations = record.max_iterations,
                blocking = blocking.len(),
                "iteration limit reached"
            );
            if let Err(e) = self
                .publish(&committed, ActionKind::LimitReached, blocking, None)
                .await
            {
                return self.fail(committed, e).await;
            }
            return Ok(DecisionOutcome::MaxIterationsReached { iteration: round });
        }

        if let Some(assessment) = self.detector.assess(&trial.history)
            && assessment.stuck
        {
            trial.status = TaskStatus::Stuck;
            let committed = self.store.commit(trial)?;
            info!(
                task_id,
                iteration = round,
                mean_similarity = assessment.mean_similarity,
                "repair loop is stuck"
            );
            if let Err(e) = self
                .publish(&committed, ActionKind::Stuck, blocking, None)
                .await
            {
                return self.fail(committed, e).await;
            }
            return Ok(DecisionOutcome::Stuck {
                iteration: round,
                mean_similarity: assessment.mean_similarity,
            });
        }

        // The slot is taken before committing so an exhausted limiter leaves no trace.
        let permit = self.limiter.acquire(task_id).await?;
        trial.status = TaskStatus::InProgress;
        trial.last_error = None;
        let committed = match self.store.commit(trial) {
            Ok(committed) => committed,
            Err(e) => {
                // No generator call happens for this round, so the slot goes back.
                self.limiter.release(task_id, &permit).await;
                return Err(e);
            }
        };
        info!(
            task_id,
            iteration = round,
            blocking = blocking.len(),
            waited = ?permit.waited,
            "requesting repair"
        );

        let request = RepairRequest {
            task_id: task_id.to_string(),
            iteration: round,
            max_iterations: committed.max_iterations,
            blocking: blocking.clone(),
        };
        let change_set =
            match tokio::time::timeout(self.generator_timeout, self.generator.repair(&request))
                .await
            {
                Ok(Ok(change_set)) => change_set,
                Ok(Err(e)) => return self.fail(committed, e).await,
                Err(_) => {
                    let e = Error::Generation(format!(
                        "generator timed out after {:?}",
                        self.generator_timeout
                    ));
                    return self.fail(committed, e).await;
                }
            };

        if let Err(e) = self
            .publish(
                &committed,
                ActionKind::RepairRequested,
                blocking,
                Some(change_set.summary.clone()),
            )
            .await
        {
            return self.fail(committed, e).await;
        }
        Ok(DecisionOutcome::RepairRequested {
            iteration: round,
            change_set,
        })
    }

    async fn publish(
        &self,
        record: &IterationRecord,
        kind: ActionKind,
        blocking: Vec<Finding>,
        change_summary: Option<String>,
    ) -> Result<()> {
        let id = ActionId::for_iteration(&record.task_id, kind, record.iteration);
        let outcome = ReviewOutcome {
            blocking,
            change_summary,
            error: record.last_error.clone(),
            ..ReviewOutcome::new(&record.task_id, kind, record.iteration, record.max_iterations)
        };
        self.idempotency
            .apply_once(&id, || self.reviewer.apply_outcome(&outcome))
            .await?;
        Ok(())
    }

    /// Commit `Failed` on top of `committed` and try to announce it.
    async fn fail(&self, committed: IterationRecord, error: Error) -> Result<DecisionOutcome> {
        let message = error.to_string();
        warn!(
            task_id = %committed.task_id,
            iteration = committed.iteration,
            error = %message,
            "decision failed"
        );

        let mut failed = committed;
        failed.status = TaskStatus::Failed;
        failed.last_error = Some(message.clone());
        let failed = self.store.commit(failed)?;

        let blocking = failed
            .latest()
            .map(|s| s.blocking().cloned().collect())
            .unwrap_or_default();
        if let Err(e) = self.publish(&failed, ActionKind::Failed, blocking, None).await {
            warn!(task_id = %failed.task_id, error = %e, "could not publish failure");
        }

        Ok(DecisionOutcome::Failed {
            iteration: failed.iteration,
            error: message,
        })
    }

    /// Re-apply the terminal effect of a record; a no-op once it has been applied.
    async fn settle_terminal(&self, record: &IterationRecord) {
        let kind = match record.status {
            TaskStatus::Approved => ActionKind::Approve,
            TaskStatus::MaxIterationsReached => ActionKind::LimitReached,
            TaskStatus::Stuck => ActionKind::Stuck,
            TaskStatus::Failed => ActionKind::Failed,
            TaskStatus::Pending | TaskStatus::InProgress => return,
        };
        let blocking = record
            .latest()
            .map(|s| s.blocking().cloned().collect())
            .unwrap_or_default();
        if let Err(e) = self.publish(record, kind, blocking, None).await {
            warn!(task_id = %record.task_id, error = %e, "could not settle terminal outcome");
        }
    }
}
