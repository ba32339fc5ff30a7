//! Wave scheduling with bounded concurrency.

use crate::aggregator::ResultAggregator;
use crate::dependency::Wave;
use crate::dispatcher::{gather_inputs, Context, StepDispatcher};
use crate::error::{EngineError, Result};
use collective_core::{Plan, Priority, StepKey, StepResult};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Budget for plan execution.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// Per-call timeout for low priority plans
    pub low_priority_timeout: Duration,
    /// Per-call timeout for normal priority plans
    pub normal_priority_timeout: Duration,
    /// Per-call timeout for high priority plans
    pub high_priority_timeout: Duration,
    /// Max steps in flight at once
    pub max_concurrent: NonZeroUsize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            low_priority_timeout: Duration::from_secs(60),
            normal_priority_timeout: Duration::from_secs(120),
            high_priority_timeout: Duration::from_secs(300),
            max_concurrent: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl Budget {
    /// Create a new budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call timeout for one priority.
    pub fn with_timeout(mut self, priority: Priority, timeout: Duration) -> Self {
        match priority {
            Priority::Low => self.low_priority_timeout = timeout,
            Priority::Normal => self.normal_priority_timeout = timeout,
            Priority::High => self.high_priority_timeout = timeout,
        }
        self
    }

    /// Set max concurrent steps.
    pub fn with_max_concurrent(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Call timeout for a plan of the given priority.
    pub fn timeout_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Low => self.low_priority_timeout,
            Priority::Normal => self.normal_priority_timeout,
            Priority::High => self.high_priority_timeout,
        }
    }
}

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Waves computed, nothing sent yet
    Planned,
    /// Steps of wave `i` in flight
    Dispatching(usize),
    /// Wave `i` finished, results being checked
    Aggregating(usize),
    /// Every wave processed
    Completed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Planned => write!(f, "planned"),
            RunState::Dispatching(i) => write!(f, "dispatching({})", i),
            RunState::Aggregating(i) => write!(f, "aggregating({})", i),
            RunState::Completed => write!(f, "completed"),
        }
    }
}

/// Drives the waves of one plan through the dispatcher.
///
/// Every step of wave `i` has a result before any step of wave `i + 1`
/// starts. A failed step never stops the run.
pub struct Coordinator {
    dispatcher: Arc<StepDispatcher>,
    budget: Budget,
}

impl Coordinator {
    /// Create a coordinator.
    pub fn new(dispatcher: Arc<StepDispatcher>, budget: Budget) -> Self {
        Self { dispatcher, budget }
    }

    /// Execute all waves and return one result per step.
    ///
    /// When `deadline` passes, in-flight steps are aborted and every step
    /// without a result is recorded as cancelled.
    pub async fn run(
        &self,
        plan: Arc<Plan>,
        waves: &[Wave],
        context: Arc<Context>,
        deadline: Option<Instant>,
    ) -> Result<BTreeMap<StepKey, StepResult>> {
        let aggregator = Arc::new(ResultAggregator::new());
        let semaphore = Arc::new(Semaphore::new(self.budget.max_concurrent.get()));
        let timeout = self.budget.timeout_for(plan.priority());

        let mut state = RunState::Planned;
        debug!(%state, waves = waves.len(), "Run state");

        for (wave_index, wave) in waves.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(wave = wave_index, "Deadline passed, cancelling remaining steps");
                for pending in &waves[wave_index..] {
                    cancel_missing(&plan, pending, &aggregator).await?;
                }
                break;
            }

            state = RunState::Dispatching(wave_index);
            debug!(%state, steps = wave.len(), "Run state");

            // Results of earlier waves are final at this point.
            let prior = aggregator.snapshot().await;
            let mut tasks = JoinSet::new();

            for key in wave {
                let Some(step) = plan.step(key.index()).cloned() else {
                    continue;
                };
                let inputs = gather_inputs(&step, &context, &prior);
                let dispatcher = self.dispatcher.clone();
                let aggregator = aggregator.clone();
                let semaphore = semaphore.clone();
                let plan = plan.clone();
                let span = info_span!("step", step = step.index, backend = %step.backend);

                tasks.spawn(
                    async move {
                        // The semaphore is never closed.
                        let _permit = semaphore.acquire().await;
                        let result = dispatcher
                            .dispatch(&step, &inputs, plan.fallback_map(), timeout)
                            .await;
                        aggregator.record(result).await
                    }
                    .instrument(span),
                );
            }

            let finished = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, drain(&mut tasks)).await.ok(),
                None => Some(drain(&mut tasks).await),
            };

            state = RunState::Aggregating(wave_index);
            debug!(%state, "Run state");

            match finished {
                Some(outcome) => outcome?,
                None => {
                    warn!(wave = wave_index, "Deadline passed mid-wave, aborting in-flight steps");
                    tasks.abort_all();
                    drain(&mut tasks).await?;
                    cancel_missing(&plan, wave, &aggregator).await?;
                }
            }
        }

        state = RunState::Completed;
        debug!(%state, "Run state");

        Ok(aggregator.snapshot().await)
    }
}

/// Wait for every task, surfacing invariant violations. Aborted tasks are fine.
async fn drain(tasks: &mut JoinSet<std::result::Result<(), crate::aggregator::DuplicateResultError>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(recorded) => recorded?,
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(EngineError::StepTask(e.to_string())),
        }
    }
    Ok(())
}

/// Record a cancellation for every step of `wave` that has no result.
async fn cancel_missing(plan: &Plan, wave: &Wave, aggregator: &ResultAggregator) -> Result<()> {
    for key in wave {
        if aggregator.contains(*key).await {
            continue;
        }
        let backend = plan
            .step(key.index())
            .map(|s| s.backend.clone())
            .unwrap_or_default();
        aggregator.record(StepResult::cancelled(key.index(), backend)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyResolver;
    use crate::testing::{plan_from, plan_json_with_priority, test_registry, validated, ScriptedClient};
    use collective_core::StepFailure;

    fn coordinator(client: &Arc<ScriptedClient>, max_concurrent: usize) -> Coordinator {
        let dispatcher = StepDispatcher::new(client.clone(), Arc::new(test_registry()));
        let budget = Budget::new().with_max_concurrent(NonZeroUsize::new(max_concurrent).unwrap());
        Coordinator::new(Arc::new(dispatcher), budget)
    }

    async fn run(
        coordinator: &Coordinator,
        plan: Plan,
        deadline: Option<Duration>,
    ) -> BTreeMap<StepKey, StepResult> {
        let waves = DependencyResolver::new().resolve(&plan).unwrap();
        let deadline = deadline.map(|d| Instant::now() + d);
        coordinator
            .run(Arc::new(plan), &waves, Arc::new(Context::new()), deadline)
            .await
            .unwrap()
    }

    #[test]
    fn test_budget_timeouts() {
        let budget = Budget::new().with_timeout(Priority::Low, Duration::from_secs(5));
        assert_eq!(budget.timeout_for(Priority::Low), Duration::from_secs(5));
        assert_eq!(budget.timeout_for(Priority::Normal), Duration::from_secs(120));
        assert_eq!(budget.timeout_for(Priority::High), Duration::from_secs(300));
        assert_eq!(budget.max_concurrent.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_priority_sets_call_timeout() {
        for (priority, expect_timeout) in [("low", Some(60)), ("normal", Some(120)), ("high", None)] {
            let client = Arc::new(ScriptedClient::new().reply_after("a", Duration::from_secs(200), "late"));
            let plan = validated(&plan_json_with_priority(&[(1, "a", &[])], &[], priority));

            let results = run(&coordinator(&client, 4), plan, None).await;
            let step = &results[&StepKey(1)];

            match expect_timeout {
                Some(secs) => {
                    assert!(step.failed, "{} priority should time out", priority);
                    let Some(StepFailure::BackendCallFailed(message)) = &step.failure else {
                        panic!("unexpected failure for {} priority: {:?}", priority, step.failure);
                    };
                    assert!(message.contains(&format!("timed out after {}s", secs)), "{}", message);
                }
                None => {
                    assert!(!step.failed, "{} priority should finish", priority);
                    assert_eq!(step.output, "late");
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_steps_run_concurrently() {
        let client = Arc::new(
            ScriptedClient::new()
                .reply_after("a", Duration::from_millis(100), "A")
                .reply_after("b", Duration::from_millis(200), "B")
                .reply_after("c", Duration::from_millis(300), "C"),
        );
        let plan = plan_from(&[(1, "a", &[]), (2, "b", &[]), (3, "c", &[])]);

        let started = Instant::now();
        let results = run(&coordinator(&client, 4), plan, None).await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 3);
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let client = Arc::new(
            ScriptedClient::new()
                .reply_after("a", Duration::from_millis(100), "A")
                .reply_after("b", Duration::from_millis(100), "B")
                .reply_after("c", Duration::from_millis(100), "C"),
        );
        let plan = plan_from(&[(1, "a", &[]), (2, "b", &[]), (3, "c", &[])]);

        let started = Instant::now();
        let results = run(&coordinator(&client, 1), plan, None).await;

        assert_eq!(results.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_downstream_sees_upstream_output() {
        let client = Arc::new(ScriptedClient::new().reply("a", "upstream draft"));
        let plan = plan_from(&[(1, "a", &["context"]), (2, "b", &["step_1"])]);

        let results = run(&coordinator(&client, 4), plan, None).await;

        assert!(!results[&StepKey(2)].failed);
        assert!(client.prompts_to("b")[0].contains("step_1:\nupstream draft"));
    }

    #[tokio::test]
    async fn test_failed_upstream_gives_sentinel() {
        let client = Arc::new(ScriptedClient::new().fail("a").reply("b", "done anyway"));
        let plan = plan_from(&[(1, "a", &["context"]), (2, "b", &["step_1"])]);

        let results = run(&coordinator(&client, 4), plan, None).await;

        assert!(results[&StepKey(1)].failed);
        assert_eq!(results[&StepKey(2)].output, "done anyway");
        let prompt = &client.prompts_to("b")[0];
        assert!(prompt.contains("step_1:\n[unavailable: step_1 failed]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_mid_wave() {
        let client = Arc::new(
            ScriptedClient::new()
                .reply_after("a", Duration::from_millis(50), "fast")
                .reply_after("b", Duration::from_secs(10), "slow"),
        );
        let plan = plan_from(&[
            (1, "a", &[]),
            (2, "a", &["step_1"]),
            (3, "b", &["step_1"]),
            (4, "c", &["step_3"]),
        ]);

        let results = run(&coordinator(&client, 4), plan, Some(Duration::from_millis(500))).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[&StepKey(1)].output, "fast");
        assert_eq!(results[&StepKey(2)].output, "fast");
        assert_eq!(results[&StepKey(3)].failure, Some(StepFailure::Cancelled));
        assert_eq!(results[&StepKey(4)].failure, Some(StepFailure::Cancelled));
        // Step 4's wave never started.
        assert!(!client.backends_called().contains(&"c".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_later_waves() {
        let client = Arc::new(
            ScriptedClient::new()
                .fail_after("a", Duration::from_millis(200))
                .reply("b", "never"),
        );
        let plan = plan_from(&[(1, "a", &[]), (2, "b", &["step_1"])]);

        let results = run(&coordinator(&client, 4), plan, Some(Duration::from_millis(100))).await;

        assert_eq!(results[&StepKey(1)].failure, Some(StepFailure::Cancelled));
        assert_eq!(results[&StepKey(2)].failure, Some(StepFailure::Cancelled));
        assert_eq!(client.backends_called(), vec!["a"]);
    }
}
