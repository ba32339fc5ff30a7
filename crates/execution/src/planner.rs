//! Asking the reasoning backend for a plan.

use crate::dispatcher::{BackendCallFailed, Context, StepDispatcher};
use collective_core::{BackendRegistry, SamplingParams};
use std::time::Duration;
use tracing::info;

/// Sampling used for planning calls.
pub const PLANNING_SAMPLING: SamplingParams = SamplingParams {
    temperature: 0.2,
    max_tokens: 2000,
};

/// Build the prompt that asks the reasoning backend for a plan.
pub fn build_planning_prompt(
    task_type: &str,
    domain: &str,
    context: &Context,
    registry: &BackendRegistry,
) -> String {
    let available = registry
        .iter()
        .map(|b| format!("- {}: {}", b.name, b.specialization))
        .collect::<Vec<_>>()
        .join("\n");
    let context_json = serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"You are the orchestrator of the Climate AI Collective. Your job is to build the best execution plan for the following task.

TASK: {task_type}
DOMAIN: {domain}

CONTEXT:
{context_json}

AVAILABLE BACKENDS:
{available}

INSTRUCTIONS:
1. Analyze the task and determine the steps required
2. Assign each step to the most suitable backend
3. Identify dependencies between steps; refer to the output of step N as "step_N" in inputs
4. Optimize for quality and efficiency

Respond ONLY with a valid JSON object in this format:
{{
    "plan": [
        {{
            "step": 1,
            "llm": "backend_name",
            "action": "action_description",
            "inputs": ["input1", "input2"],
            "expected_output": "output_description"
        }}
    ],
    "fallback": {{
        "backend_name": "substitute_backend_name"
    }},
    "estimated_duration_minutes": 15,
    "priority": "high"
}}

RESPOND WITH THE JSON ONLY, NOTHING ELSE.
"#
    )
}

/// Requests plans from the reasoning backend.
pub struct Planner<'a> {
    dispatcher: &'a StepDispatcher,
    registry: &'a BackendRegistry,
    backend: &'a str,
    timeout: Duration,
}

impl<'a> Planner<'a> {
    /// Create a planner that calls `backend`.
    pub fn new(
        dispatcher: &'a StepDispatcher,
        registry: &'a BackendRegistry,
        backend: &'a str,
        timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            backend,
            timeout,
        }
    }

    /// Raw plan text from the reasoning backend. Not yet validated.
    pub async fn request_plan(
        &self,
        task_type: &str,
        domain: &str,
        context: &Context,
    ) -> Result<String, BackendCallFailed> {
        info!(task_type, domain, backend = self.backend, "Creating execution plan");

        let prompt = build_planning_prompt(task_type, domain, context, self.registry);
        // Step 0 is the planning call itself.
        self.dispatcher
            .call(0, self.backend, &prompt, PLANNING_SAMPLING, self.timeout)
            .await
    }
}
