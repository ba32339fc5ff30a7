//! Per-run accumulation of step results.

use collective_core::{StepKey, StepResult};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// A second result arrived for a step that already has one.
///
/// Correct scheduling never produces this.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate result for {0}")]
pub struct DuplicateResultError(pub StepKey);

/// Concurrent-safe map of step results, one per step.
///
/// Each run owns its own aggregator.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: RwLock<BTreeMap<StepKey, StepResult>>,
}

impl ResultAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's result. Never overwrites.
    pub async fn record(&self, result: StepResult) -> Result<(), DuplicateResultError> {
        let mut results = self.results.write().await;
        match results.entry(result.key()) {
            Entry::Occupied(entry) => Err(DuplicateResultError(*entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(result);
                Ok(())
            }
        }
    }

    /// Copy of everything recorded so far.
    pub async fn snapshot(&self) -> BTreeMap<StepKey, StepResult> {
        self.results.read().await.clone()
    }

    /// Whether a step has a result.
    pub async fn contains(&self, key: StepKey) -> bool {
        self.results.read().await.contains_key(&key)
    }

    /// Number of recorded results.
    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    /// Whether nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}
