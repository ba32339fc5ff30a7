//! Validation of plan JSON returned by the reasoning backend.
//!
//! This is the only place raw plan input is coerced or rejected.

use crate::{ActionKind, BackendRegistry, InputRef, Plan, Priority, Step, TaskId};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Why a raw plan could not be accepted.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Body is not UTF-8
    #[error("plan is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Body is not JSON of the expected shape
    #[error("plan JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No steps at all
    #[error("plan has no steps")]
    EmptyPlan,

    /// Step index must be positive
    #[error("invalid step index: {0}")]
    InvalidStepIndex(u32),

    /// Two steps share an index
    #[error("duplicate step index: {0}")]
    DuplicateStep(u32),

    /// An input references a step that is not in the plan
    #[error("step {step} references {reference}, which is not in the plan")]
    UnknownStepReference {
        /// Referencing step
        step: u32,
        /// Reference as written
        reference: String,
    },

    /// Priority is not low/normal/high
    #[error("unknown priority: {0}")]
    UnknownPriority(String),

    /// Fallback map names a backend that is not registered
    #[error("fallback names unknown backend: {0}")]
    UnknownFallbackBackend(String),
}

#[derive(Debug, Deserialize)]
struct WirePlan {
    plan: Vec<WireStep>,
    #[serde(default)]
    fallback: BTreeMap<String, String>,
    estimated_duration_minutes: u32,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStep {
    step: u32,
    llm: String,
    action: String,
    inputs: Vec<String>,
    expected_output: String,
    #[serde(default)]
    parallel_with: Option<Vec<u32>>,
    #[serde(default)]
    action_kind: Option<ActionKind>,
}

impl WireStep {
    fn into_step(self) -> Step {
        let action_kind = self
            .action_kind
            .unwrap_or_else(|| ActionKind::classify(&self.action));

        Step {
            index: self.step,
            backend: self.llm,
            action: self.action,
            action_kind,
            inputs: self.inputs.iter().map(|name| InputRef::parse(name)).collect(),
            expected_output: self.expected_output,
            parallel_with: self.parallel_with.unwrap_or_default().into_iter().collect(),
        }
    }
}

/// Validate raw plan JSON into a [`Plan`].
///
/// Expected shape:
/// ```json
/// {"plan": [{"step": 1, "llm": "mistral-large", "action": "...",
///            "inputs": ["context"], "expected_output": "..."}],
///  "fallback": {"mistral-large": "llama-3-3"},
///  "estimated_duration_minutes": 15,
///  "priority": "high"}
/// ```
pub fn validate(
    raw: &[u8],
    task_id: TaskId,
    domain: &str,
    registry: &BackendRegistry,
) -> Result<Plan, SchemaError> {
    let text = std::str::from_utf8(raw)?;
    let wire: WirePlan = serde_json::from_str(text.trim())?;

    let priority = match wire.priority.as_deref() {
        Some(raw) => raw.parse()?,
        None => Priority::default(),
    };

    let steps = wire.plan.into_iter().map(WireStep::into_step).collect();

    Plan::new(
        task_id,
        domain,
        steps,
        wire.fallback,
        wire.estimated_duration_minutes,
        priority,
        registry,
    )
}
