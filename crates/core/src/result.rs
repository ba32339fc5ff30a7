//! Per-step and per-run execution results.

use crate::{RunId, StepKey, TaskId, Time};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why a step ended without output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StepFailure {
    /// Backend call (and fallback, if any) failed
    BackendCallFailed(String),
    /// Run deadline elapsed before the step finished
    Cancelled,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::BackendCallFailed(message) => write!(f, "backend call failed: {}", message),
            StepFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one step. Produced exactly once per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step index
    pub step_index: u32,
    /// Backend that produced the outcome
    pub backend_used: String,
    /// Completion text (empty when failed)
    pub output: String,
    /// When the outcome was recorded
    pub timestamp: Time,
    /// Whether the fallback backend was used
    pub used_fallback: bool,
    /// Whether the step failed
    pub failed: bool,
    /// Failure reason, set exactly when `failed` is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}

impl StepResult {
    /// Successful call against the step's own backend.
    pub fn success(step_index: u32, backend: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            step_index,
            backend_used: backend.into(),
            output: output.into(),
            timestamp: chrono::Utc::now(),
            used_fallback: false,
            failed: false,
            failure: None,
        }
    }

    /// Successful call against the substitute backend.
    pub fn fallback_success(step_index: u32, backend: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            used_fallback: true,
            ..Self::success(step_index, backend, output)
        }
    }

    /// Terminal failure.
    pub fn failure(step_index: u32, backend: impl Into<String>, used_fallback: bool, failure: StepFailure) -> Self {
        Self {
            step_index,
            backend_used: backend.into(),
            output: String::new(),
            timestamp: chrono::Utc::now(),
            used_fallback,
            failed: true,
            failure: Some(failure),
        }
    }

    /// Step that never finished because the run deadline elapsed.
    pub fn cancelled(step_index: u32, backend: impl Into<String>) -> Self {
        Self::failure(step_index, backend, false, StepFailure::Cancelled)
    }

    /// Key of the step this result belongs to.
    pub fn key(&self) -> StepKey {
        StepKey(self.step_index)
    }
}

/// Why the engine ran the fallback plan instead of the supplied one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPlanReason {
    /// Plan failed validation
    Schema(String),
    /// Plan steps form a cycle
    CyclicDependency(String),
    /// Reasoning backend could not be reached
    PlannerUnavailable(String),
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Run that produced this result
    pub run_id: RunId,
    /// Plan identifier
    pub task_id: TaskId,
    /// Plan domain
    pub domain: String,
    /// One entry per step, failed ones included
    pub results: BTreeMap<StepKey, StepResult>,
    /// Set when the fallback plan replaced the supplied plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_plan: Option<FallbackPlanReason>,
    /// When the run finished
    pub completed_at: Time,
}

impl ExecutionResult {
    /// Result for a step, if recorded.
    pub fn get(&self, key: StepKey) -> Option<&StepResult> {
        self.results.get(&key)
    }

    /// Results of failed steps in index order.
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.results.values().filter(|r| r.failed)
    }

    /// Whether every step succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(|r| !r.failed)
    }
}
