use tracing::debug;

use crate::finding::FindingSnapshot;
use crate::similarity::message_set_similarity;

/// Number of trailing snapshots compared.
pub const STUCK_WINDOW: usize = 3;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.70;

/// Evidence computed over the last [`STUCK_WINDOW`] snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckAssessment {
    pub mean_similarity: f64,
    pub blocking_counts: Vec<usize>,
    pub stuck: bool,
}

/// Detects repair loops that keep producing the same Blocking findings.
#[derive(Debug, Clone, Copy)]
pub struct StuckDetector {
    threshold: f64,
}

impl Default for StuckDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl StuckDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Returns `None` when the history is too short to judge.
    pub fn assess(&self, history: &[FindingSnapshot]) -> Option<StuckAssessment> {
        if history.len() < STUCK_WINDOW {
            return None;
        }
        let window = &history[history.len() - STUCK_WINDOW..];
        let messages: Vec<Vec<&str>> = window.iter().map(|s| s.blocking_messages()).collect();

        let pairs = [(0, 1), (0, 2), (1, 2)];
        let total: f64 = pairs
            .iter()
            .map(|&(i, j)| message_set_similarity(&messages[i], &messages[j]))
            .sum();
        let mean_similarity = total / pairs.len() as f64;

        let blocking_counts: Vec<usize> = window.iter().map(|s| s.blocking_count()).collect();
        let non_decreasing = blocking_counts.windows(2).all(|w| w[1] >= w[0]);

        let stuck = mean_similarity > self.threshold && non_decreasing;
        debug!(
            mean_similarity,
            threshold = self.threshold,
            ?blocking_counts,
            stuck,
            "assessed recent history"
        );

        Some(StuckAssessment {
            mean_similarity,
            blocking_counts,
            stuck,
        })
    }

    pub fn is_stuck(&self, history: &[FindingSnapshot]) -> bool {
        self.assess(history).is_some_and(|a| a.stuck)
    }
}
