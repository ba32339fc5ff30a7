//! Plan and step model.

use crate::{BackendRegistry, SchemaError, StepKey, TaskId};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

/// Action of the single step in a fallback plan.
pub const FALLBACK_ACTION: &str = "generate_proposal";

/// Plan priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low
    Low,
    /// Normal
    #[default]
    Normal,
    /// High
    High,
}

impl std::str::FromStr for Priority {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(SchemaError::UnknownPriority(s.to_string())),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Sampling parameters sent with a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature
    pub temperature: f32,
    /// Upper bound on generated tokens
    pub max_tokens: u32,
}

/// What kind of work a step does. Fixes its sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Open-ended generation (higher entropy)
    Generate,
    /// Checking or verifying prior output
    Validate,
    /// Merging or summarizing prior output
    Synthesize,
}

impl ActionKind {
    /// Classify a free-form action name.
    ///
    /// Known heuristic: any action containing "generate" samples hot, the
    /// reasoning backend does not otherwise tell us what a step does.
    pub fn classify(action: &str) -> Self {
        let action = action.to_lowercase();
        if action.contains("generate") {
            ActionKind::Generate
        } else if action.contains("valid") || action.contains("verif") {
            ActionKind::Validate
        } else {
            ActionKind::Synthesize
        }
    }

    /// Sampling parameters for this kind of step.
    pub fn sampling(self) -> SamplingParams {
        match self {
            ActionKind::Generate => SamplingParams { temperature: 0.7, max_tokens: 4000 },
            ActionKind::Validate | ActionKind::Synthesize => SamplingParams { temperature: 0.2, max_tokens: 4000 },
        }
    }
}

/// Parse `step_<N>` into `N`. Only the canonical spelling counts, so a
/// reference always prints back the way it was declared.
pub fn parse_step_reference(name: &str) -> Option<u32> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^step_([1-9]\d*)$").expect("static pattern"));
    pattern.captures(name)?.get(1)?.as_str().parse().ok()
}

/// A declared step input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputRef {
    /// Named value from the caller's context
    Context(String),
    /// Output of another step
    Step(StepKey),
}

impl InputRef {
    /// Parse a wire input name.
    pub fn parse(name: &str) -> Self {
        match parse_step_reference(name) {
            Some(index) => InputRef::Step(StepKey(index)),
            None => InputRef::Context(name.to_string()),
        }
    }

    /// Name as it appears in the plan and in prompts.
    pub fn name(&self) -> String {
        match self {
            InputRef::Context(name) => name.clone(),
            InputRef::Step(key) => key.to_string(),
        }
    }
}

impl Serialize for InputRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// One unit of work assigned to a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    /// Positive index, unique within the plan
    pub index: u32,
    /// Backend name (may be unknown; that fails at dispatch)
    pub backend: String,
    /// Free-form action name
    pub action: String,
    /// Kind of action, decided once when the plan is built
    pub action_kind: ActionKind,
    /// Declared inputs in order
    pub inputs: Vec<InputRef>,
    /// Label describing the expected output
    pub expected_output: String,
    /// Advisory concurrency hints
    pub parallel_with: BTreeSet<u32>,
}

impl Step {
    /// Key of this step.
    pub fn key(&self) -> StepKey {
        StepKey(self.index)
    }

    /// Steps whose output this step consumes, in declared order.
    pub fn dependencies(&self) -> impl Iterator<Item = StepKey> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            InputRef::Step(key) => Some(*key),
            InputRef::Context(_) => None,
        })
    }
}

/// A validated execution plan.
///
/// Only [`crate::validate`] and [`Plan::fallback`] produce plans, so every
/// plan has at least one step, unique positive indices, step references that
/// resolve inside the plan, and a fallback map over registered backends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    task_id: TaskId,
    domain: String,
    steps: Vec<Step>,
    fallback: BTreeMap<String, String>,
    estimated_duration_minutes: u32,
    priority: Priority,
}

impl Plan {
    /// Check structural invariants and build a plan.
    pub fn new(
        task_id: TaskId,
        domain: impl Into<String>,
        mut steps: Vec<Step>,
        fallback: BTreeMap<String, String>,
        estimated_duration_minutes: u32,
        priority: Priority,
        registry: &BackendRegistry,
    ) -> Result<Self, SchemaError> {
        if steps.is_empty() {
            return Err(SchemaError::EmptyPlan);
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if step.index == 0 {
                return Err(SchemaError::InvalidStepIndex(step.index));
            }
            if !seen.insert(step.index) {
                return Err(SchemaError::DuplicateStep(step.index));
            }
        }

        for step in &steps {
            if let Some(missing) = step.dependencies().find(|dep| !seen.contains(&dep.index())) {
                return Err(SchemaError::UnknownStepReference {
                    step: step.index,
                    reference: missing.to_string(),
                });
            }
        }

        // Hints to steps that do not exist carry no information.
        for step in &mut steps {
            let own = step.index;
            step.parallel_with.retain(|other| *other != own && seen.contains(other));
        }

        for (from, to) in &fallback {
            for name in [from, to] {
                if !registry.contains(name) {
                    return Err(SchemaError::UnknownFallbackBackend(name.clone()));
                }
            }
        }

        Ok(Self {
            task_id,
            domain: domain.into(),
            steps,
            fallback,
            estimated_duration_minutes,
            priority,
        })
    }

    /// Single-step plan used when the supplied plan cannot be executed.
    ///
    /// Pure: the same arguments always produce the same plan.
    pub fn fallback(
        task_id: TaskId,
        domain: impl Into<String>,
        default_backend: impl Into<String>,
        estimated_duration_minutes: u32,
    ) -> Self {
        let step = Step {
            index: 1,
            backend: default_backend.into(),
            action: FALLBACK_ACTION.to_string(),
            action_kind: ActionKind::Generate,
            inputs: vec![
                InputRef::Context("context".to_string()),
                InputRef::Context("data".to_string()),
            ],
            expected_output: "proposal".to_string(),
            parallel_with: BTreeSet::new(),
        };

        Self {
            task_id,
            domain: domain.into(),
            steps: vec![step],
            fallback: BTreeMap::new(),
            estimated_duration_minutes,
            priority: Priority::Normal,
        }
    }

    /// Plan identifier.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Domain the plan works on.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Steps in declared order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look up a step by index.
    pub fn step(&self, index: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.index == index)
    }

    /// Backend name → substitute backend name.
    pub fn fallback_map(&self) -> &BTreeMap<String, String> {
        &self.fallback
    }

    /// Estimated duration.
    pub fn estimated_duration_minutes(&self) -> u32 {
        self.estimated_duration_minutes
    }

    /// Priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }
}
