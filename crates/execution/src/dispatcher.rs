//! Sending one step to its backend.

use crate::fallback::FallbackRouter;
use collective_backend::{BackendFailure, CompletionClient, CompletionRequest};
use collective_core::{BackendRegistry, InputRef, SamplingParams, Step, StepFailure, StepKey, StepResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Caller-supplied named values that steps may take as inputs.
pub type Context = BTreeMap<String, Value>;

/// Input value handed to a step whose upstream step failed.
pub fn unavailable_marker(key: StepKey) -> String {
    format!("[unavailable: {} failed]", key)
}

/// Placeholder for an input the caller did not supply.
pub fn external_placeholder(name: &str) -> String {
    format!("[External data: {}]", name)
}

/// One backend call for one step failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("step {step} failed on backend {backend}: {failure}")]
pub struct BackendCallFailed {
    /// Step index
    pub step: u32,
    /// Backend that was called
    pub backend: String,
    /// Underlying failure
    #[source]
    pub failure: BackendFailure,
}

/// Resolve a step's declared inputs to values, in declared order.
///
/// `prior` must hold the results of every wave before this step's wave.
pub fn gather_inputs(
    step: &Step,
    context: &Context,
    prior: &BTreeMap<StepKey, StepResult>,
) -> Vec<(String, String)> {
    step.inputs
        .iter()
        .map(|input| {
            let value = match input {
                InputRef::Step(key) => match prior.get(key) {
                    Some(result) if !result.failed => result.output.clone(),
                    _ => unavailable_marker(*key),
                },
                InputRef::Context(name) => match context.get(name) {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
                    None => external_placeholder(name),
                },
            };
            (input.name(), value)
        })
        .collect()
}

/// Assemble the prompt sent for a step.
pub fn build_step_prompt(step: &Step, inputs: &[(String, String)]) -> String {
    let inputs_text = inputs
        .iter()
        .map(|(name, value)| format!("{}:\n{}", name, value))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "ACTION: {}\n\n\
         INPUTS:\n{}\n\n\
         INSTRUCTIONS:\n\
         Carry out the requested action using the inputs provided.\n\
         Produce a high-quality result; it will be used by the following steps.\n\n\
         EXPECTED OUTPUT: {}\n",
        step.action, inputs_text, step.expected_output
    )
}

/// Sends steps to backends, retrying once on a substitute.
pub struct StepDispatcher {
    client: Arc<dyn CompletionClient>,
    registry: Arc<BackendRegistry>,
    router: FallbackRouter,
}

impl StepDispatcher {
    /// Create a dispatcher over a client and registry.
    pub fn new(client: Arc<dyn CompletionClient>, registry: Arc<BackendRegistry>) -> Self {
        Self {
            client,
            registry,
            router: FallbackRouter::new(),
        }
    }

    /// One bounded call to one backend.
    pub async fn call(
        &self,
        step: u32,
        backend: &str,
        prompt: &str,
        sampling: SamplingParams,
        timeout: Duration,
    ) -> Result<String, BackendCallFailed> {
        let failed = |failure| BackendCallFailed {
            step,
            backend: backend.to_string(),
            failure,
        };

        let target = self
            .registry
            .get(backend)
            .ok_or_else(|| failed(BackendFailure::UnknownBackend(backend.to_string())))?;

        let request = CompletionRequest::new(target, prompt, sampling);
        match tokio::time::timeout(timeout, self.client.complete(target, &request)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(failure)) => Err(failed(failure)),
            Err(_) => Err(failed(BackendFailure::Timeout(timeout))),
        }
    }

    /// Run a step against its backend, then at most once against the
    /// plan's substitute. Failures end up in the returned result.
    pub async fn dispatch(
        &self,
        step: &Step,
        inputs: &[(String, String)],
        fallback: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> StepResult {
        let prompt = build_step_prompt(step, inputs);
        let sampling = step.action_kind.sampling();

        info!(step = step.index, backend = %step.backend, action = %step.action, "Executing step");

        let primary = match self.call(step.index, &step.backend, &prompt, sampling, timeout).await {
            Ok(output) => return StepResult::success(step.index, &step.backend, output),
            Err(e) => e,
        };
        error!(step = step.index, error = %primary, "Step execution failed");

        let substitute = match self.router.route(step, &step.backend, fallback) {
            Ok(substitute) => substitute,
            Err(_) => {
                return StepResult::failure(
                    step.index,
                    &step.backend,
                    false,
                    StepFailure::BackendCallFailed(primary.to_string()),
                )
            }
        };

        match self.call(step.index, substitute, &prompt, sampling, timeout).await {
            Ok(output) => StepResult::fallback_success(step.index, substitute, output),
            Err(e) => {
                error!(step = step.index, error = %e, "Fallback attempt failed");
                StepResult::failure(
                    step.index,
                    substitute,
                    true,
                    StepFailure::BackendCallFailed(format!("{}; fallback: {}", primary, e)),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{plan_from, plan_json, test_registry, validated, ScriptedClient};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn dispatcher(client: &Arc<ScriptedClient>) -> StepDispatcher {
        StepDispatcher::new(client.clone(), Arc::new(test_registry()))
    }

    #[test]
    fn test_gather_inputs() {
        let plan = plan_from(&[
            (1, "a", &[]),
            (2, "a", &[]),
            (3, "a", &["step_1", "step_2", "context", "count", "data"]),
        ]);

        let mut prior = BTreeMap::new();
        prior.insert(StepKey(1), StepResult::success(1, "a", "draft text"));
        prior.insert(
            StepKey(2),
            StepResult::failure(2, "a", false, StepFailure::BackendCallFailed("down".into())),
        );

        let mut context = Context::new();
        context.insert("context".into(), json!("transport sector"));
        context.insert("count".into(), json!(42));

        let inputs = gather_inputs(plan.step(3).unwrap(), &context, &prior);
        assert_eq!(
            inputs,
            vec![
                ("step_1".to_string(), "draft text".to_string()),
                ("step_2".to_string(), "[unavailable: step_2 failed]".to_string()),
                ("context".to_string(), "transport sector".to_string()),
                ("count".to_string(), "42".to_string()),
                ("data".to_string(), "[External data: data]".to_string()),
            ]
        );
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let plan = plan_from(&[(1, "a", &["context"])]);
        let step = &plan.steps()[0];
        let inputs = vec![("context".to_string(), "ctx".to_string())];

        let prompt = build_step_prompt(step, &inputs);
        assert_eq!(prompt, build_step_prompt(step, &inputs));
        assert!(prompt.starts_with("ACTION: act_1\n\nINPUTS:\ncontext:\nctx\n\n"));
        assert!(prompt.ends_with("EXPECTED OUTPUT: output_1\n"));
    }

    #[tokio::test]
    async fn test_success_uses_action_kind_sampling() {
        let client = Arc::new(ScriptedClient::new().reply("mistral-large", "proposal"));
        let plan = validated(
            r#"{"plan": [{"step": 1, "llm": "mistral-large", "action": "generate_draft",
                          "inputs": [], "expected_output": "draft"}],
                "estimated_duration_minutes": 1}"#,
        );

        let result = dispatcher(&client)
            .dispatch(&plan.steps()[0], &[], plan.fallback_map(), TIMEOUT)
            .await;

        assert!(!result.failed);
        assert!(!result.used_fallback);
        assert_eq!(result.output, "proposal");
        assert_eq!(client.calls()[0].temperature, 0.7);
        assert_eq!(client.calls()[0].max_tokens, 4000);
    }

    #[tokio::test]
    async fn test_fallback_retried_exactly_once() {
        let client = Arc::new(ScriptedClient::new().fail("a").reply("b", "from b"));
        let plan = validated(&plan_json(&[(1, "a", &[])], &[("a", "b"), ("b", "c")]));

        let result = dispatcher(&client)
            .dispatch(&plan.steps()[0], &[], plan.fallback_map(), TIMEOUT)
            .await;

        assert!(!result.failed);
        assert!(result.used_fallback);
        assert_eq!(result.backend_used, "b");
        assert_eq!(client.backends_called(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal() {
        let client = Arc::new(ScriptedClient::new().fail("a").fail("b"));
        let plan = validated(&plan_json(&[(1, "a", &[])], &[("a", "b"), ("b", "c")]));

        let result = dispatcher(&client)
            .dispatch(&plan.steps()[0], &[], plan.fallback_map(), TIMEOUT)
            .await;

        assert!(result.failed);
        assert!(result.used_fallback);
        assert_eq!(result.backend_used, "b");
        // b's own substitute is not consulted.
        assert_eq!(client.backends_called(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_without_fallback() {
        let client = Arc::new(ScriptedClient::new().fail("a"));
        let plan = plan_from(&[(1, "a", &[])]);

        let result = dispatcher(&client)
            .dispatch(&plan.steps()[0], &[], plan.fallback_map(), TIMEOUT)
            .await;

        assert!(result.failed);
        assert!(!result.used_fallback);
        assert!(matches!(result.failure, Some(StepFailure::BackendCallFailed(_))));
        assert_eq!(client.backends_called(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_at_dispatch() {
        let client = Arc::new(ScriptedClient::new());
        let plan = validated(&plan_json(&[(1, "gpt-9", &[])], &[]));

        let result = dispatcher(&client)
            .dispatch(&plan.steps()[0], &[], plan.fallback_map(), TIMEOUT)
            .await;

        assert!(result.failed);
        assert!(client.calls().is_empty());
        let Some(StepFailure::BackendCallFailed(message)) = result.failure else {
            panic!("expected backend failure");
        };
        assert!(message.contains("unknown backend"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let client = Arc::new(
            ScriptedClient::new()
                .reply_after("a", Duration::from_secs(30), "late")
                .reply("b", "on time"),
        );
        let plan = validated(&plan_json(&[(1, "a", &[])], &[("a", "b")]));

        let result = dispatcher(&client)
            .dispatch(&plan.steps()[0], &[], plan.fallback_map(), Duration::from_secs(1))
            .await;

        assert!(result.used_fallback);
        assert_eq!(result.output, "on time");
    }
}
