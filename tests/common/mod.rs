#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reviewloop::controller::{LoopController, LoopSettings, Trigger};
use reviewloop::error::{Error, Result};
use reviewloop::generator::{ChangeSet, GeneratorClient, RepairRequest};
use reviewloop::ledger::{ActionKind, MemoryLedger, Outcome};
use reviewloop::rate_limit::{RateLimitPolicy, RateLimitScope, RateLimiter};
use reviewloop::review::{ReviewClient, ReviewOutcome};
use reviewloop::state::MemoryStore;

/// Generator double: counts calls and can fail or stall on demand.
#[derive(Clone, Default)]
pub struct MockGenerator {
    pub calls: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<RepairRequest>>>,
    pub fail_with: Option<String>,
    pub delay: Option<Duration>,
}

impl MockGenerator {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GeneratorClient for MockGenerator {
    async fn repair(&self, request: &RepairRequest) -> Result<ChangeSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(ref message) = self.fail_with {
            return Err(Error::Generation(message.clone()));
        }
        Ok(ChangeSet {
            summary: format!("repair {} of {}", request.iteration, request.task_id),
            files_changed: vec!["src/app.py".to_string()],
        })
    }
}

/// Review client double: records every outcome it is asked to publish.
#[derive(Clone, Default)]
pub struct MockReviewClient {
    pub published: Arc<Mutex<Vec<(ActionKind, u32)>>>,
    pub fail: bool,
    pub delay: Option<Duration>,
}

impl MockReviewClient {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.published.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl ReviewClient for MockReviewClient {
    async fn apply_outcome(&self, outcome: &ReviewOutcome) -> Result<Outcome> {
        if self.fail {
            return Err(Error::ExternalService("HTTP 502".to_string()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.published
            .lock()
            .unwrap()
            .push((outcome.kind, outcome.iteration));
        Ok(Outcome::new(format!("{} on {}", outcome.kind, outcome.task_id)))
    }
}

pub type TestController = LoopController<MockGenerator, MockReviewClient>;

pub fn generous_limiter() -> RateLimiter {
    RateLimiter::new(
        RateLimitPolicy {
            quota: 100,
            window: Duration::from_secs(60),
            max_wait: Duration::from_secs(1),
        },
        RateLimitScope::Global,
    )
}

pub fn controller(max_iterations: u32, generator: MockGenerator) -> TestController {
    controller_with(
        max_iterations,
        generator,
        MockReviewClient::default(),
        generous_limiter(),
    )
}

pub fn controller_with(
    max_iterations: u32,
    generator: MockGenerator,
    reviewer: MockReviewClient,
    limiter: RateLimiter,
) -> TestController {
    LoopController::new(
        Arc::new(MemoryStore::new(max_iterations)),
        Arc::new(MemoryLedger::new()),
        limiter,
        generator,
        reviewer,
        LoopSettings::default(),
    )
}

/// A test report JSON with one failure per `(name, message)` pair.
pub fn test_report(failures: &[(&str, &str)]) -> String {
    let failures: Vec<serde_json::Value> = failures
        .iter()
        .map(|(name, message)| {
            serde_json::json!({
                "test_name": name,
                "file": "tests/test_app.py",
                "message": message,
            })
        })
        .collect();
    serde_json::json!({ "failures": failures }).to_string()
}

pub fn trigger(task_id: &str, delivery_id: &str, reports: &[(&str, String)]) -> Trigger {
    let reports: BTreeMap<String, String> = reports
        .iter()
        .map(|(source, raw)| (source.to_string(), raw.clone()))
        .collect();
    Trigger::new(task_id, reports).with_delivery_id(delivery_id)
}

pub fn passing_trigger(task_id: &str, delivery_id: &str) -> Trigger {
    trigger(task_id, delivery_id, &[("tests", test_report(&[]))])
}

pub fn failing_trigger(task_id: &str, delivery_id: &str, failures: &[(&str, &str)]) -> Trigger {
    trigger(task_id, delivery_id, &[("tests", test_report(failures))])
}
