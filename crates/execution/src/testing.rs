//! Test doubles shared by the execution tests.

use async_trait::async_trait;
use collective_backend::{BackendFailure, CompletionClient, CompletionRequest};
use collective_core::{validate, Backend, BackendRegistry, Plan, TaskId};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Builtin backends plus `a`, `b` and `c`.
pub(crate) fn test_registry() -> BackendRegistry {
    let mut backends: Vec<Backend> = BackendRegistry::builtin().iter().cloned().collect();
    for name in ["a", "b", "c"] {
        backends.push(Backend::new(name, format!("http://{}:8000/v1", name), format!("model-{}", name), "test"));
    }
    BackendRegistry::from_backends(backends).unwrap()
}

/// Wire JSON for a plan of `(index, backend, inputs)` steps.
///
/// Actions are `act_<N>`, expected outputs `output_<N>`.
pub(crate) fn plan_json(steps: &[(u32, &str, &[&str])], fallback: &[(&str, &str)]) -> String {
    plan_json_with_priority(steps, fallback, "normal")
}

/// Like [`plan_json`] with an explicit priority string.
pub(crate) fn plan_json_with_priority(
    steps: &[(u32, &str, &[&str])],
    fallback: &[(&str, &str)],
    priority: &str,
) -> String {
    let steps: Vec<_> = steps
        .iter()
        .map(|(index, backend, inputs)| {
            json!({
                "step": index,
                "llm": backend,
                "action": format!("act_{}", index),
                "inputs": inputs,
                "expected_output": format!("output_{}", index),
            })
        })
        .collect();
    let fallback: HashMap<&str, &str> = fallback.iter().copied().collect();

    json!({
        "plan": steps,
        "fallback": fallback,
        "estimated_duration_minutes": 5,
        "priority": priority,
    })
    .to_string()
}

/// Validate JSON against the test registry.
pub(crate) fn validated(json: &str) -> Plan {
    validate(json.as_bytes(), TaskId::new("test_task"), "test", &test_registry()).unwrap()
}

/// Validated plan without fallbacks.
pub(crate) fn plan_from(steps: &[(u32, &str, &[&str])]) -> Plan {
    validated(&plan_json(steps, &[]))
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Reply(String),
    Fail,
}

#[derive(Debug, Clone)]
struct Behavior {
    delay: Duration,
    outcome: Outcome,
}

/// A recorded call.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub backend: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Completion client with scripted per-backend delay and outcome.
///
/// Unscripted backends answer `ok from <name>` immediately.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn script(mut self, backend: &str, delay: Duration, outcome: Outcome) -> Self {
        self.behaviors.insert(backend.to_string(), Behavior { delay, outcome });
        self
    }

    pub(crate) fn reply(self, backend: &str, text: &str) -> Self {
        self.script(backend, Duration::ZERO, Outcome::Reply(text.to_string()))
    }

    pub(crate) fn reply_after(self, backend: &str, delay: Duration, text: &str) -> Self {
        self.script(backend, delay, Outcome::Reply(text.to_string()))
    }

    pub(crate) fn fail(self, backend: &str) -> Self {
        self.script(backend, Duration::ZERO, Outcome::Fail)
    }

    pub(crate) fn fail_after(self, backend: &str, delay: Duration) -> Self {
        self.script(backend, delay, Outcome::Fail)
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn backends_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.backend).collect()
    }

    pub(crate) fn prompts_to(&self, backend: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.backend == backend)
            .map(|c| c.prompt)
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, backend: &Backend, request: &CompletionRequest) -> Result<String, BackendFailure> {
        self.calls.lock().unwrap().push(Call {
            backend: backend.name.clone(),
            prompt: request.prompt().to_string(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        });

        let behavior = self.behaviors.get(&backend.name).cloned().unwrap_or(Behavior {
            delay: Duration::ZERO,
            outcome: Outcome::Reply(format!("ok from {}", backend.name)),
        });

        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }

        match behavior.outcome {
            Outcome::Reply(text) => Ok(text),
            Outcome::Fail => Err(BackendFailure::Status {
                status: 503,
                body: format!("{} unavailable", backend.name),
            }),
        }
    }
}
