use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Whether one window is shared by every task or each task gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    #[default]
    Global,
    #[serde(alias = "per-task", alias = "per_task")]
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub quota: usize,
    pub window: Duration,
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            quota: 10,
            window: Duration::from_secs(60),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Proof that a call slot was admitted.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    pub admitted_at: Instant,
    pub waited: Duration,
}

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Sliding-window admission control for outbound generator calls.
///
/// Cloning shares the underlying windows.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    policy: RateLimitPolicy,
    scope: RateLimitScope,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, scope: RateLimitScope) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                policy,
                scope,
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.inner.policy
    }

    async fn window_for(&self, task_id: &str) -> Window {
        let key = match self.inner.scope {
            RateLimitScope::Global => "",
            RateLimitScope::Task => task_id,
        };
        let mut windows = self.inner.windows.lock().await;
        windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    /// Wait for a free slot in the trailing window.
    ///
    /// Fails with [`Error::RateLimitExceeded`] when no slot can open before `max_wait` elapses.
    pub async fn acquire(&self, task_id: &str) -> Result<Permit> {
        let policy = self.inner.policy;
        let window = self.window_for(task_id).await;
        let started = Instant::now();
        let deadline = started + policy.max_wait;

        loop {
            let now = Instant::now();
            let ready_at = {
                let mut stamps = window.lock().await;
                while stamps
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= policy.window)
                {
                    stamps.pop_front();
                }
                if stamps.len() < policy.quota {
                    stamps.push_back(now);
                    let waited = now.duration_since(started);
                    debug!(task_id, in_window = stamps.len(), ?waited, "rate limit slot admitted");
                    return Ok(Permit {
                        admitted_at: now,
                        waited,
                    });
                }
                match stamps.front() {
                    Some(oldest) => *oldest + policy.window,
                    None => now,
                }
            };

            if ready_at > deadline {
                let waited = now.duration_since(started);
                warn!(task_id, ?waited, "rate limit exceeded");
                return Err(Error::RateLimitExceeded { waited });
            }

            warn!(
                task_id,
                wait = ?ready_at.duration_since(now),
                "rate limit reached, waiting for a slot"
            );
            tokio::time::sleep_until(ready_at).await;
        }
    }

    /// Return an unused slot to its window.
    pub async fn release(&self, task_id: &str, permit: &Permit) {
        let window = self.window_for(task_id).await;
        let mut stamps = window.lock().await;
        if let Some(pos) = stamps.iter().position(|t| *t == permit.admitted_at) {
            stamps.remove(pos);
            debug!(task_id, in_window = stamps.len(), "rate limit slot released");
        }
    }
}
