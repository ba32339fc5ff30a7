//! The execution engine - validates, resolves and runs plans.

use crate::dependency::{DependencyResolver, Wave};
use crate::dispatcher::{Context, StepDispatcher};
use crate::error::Result;
use crate::planner::Planner;
use crate::scheduler::{Budget, Coordinator};
use collective_backend::CompletionClient;
use collective_core::{
    validate, BackendRegistry, ExecutionResult, FallbackPlanReason, Plan, Priority, RunId, Step,
    TaskId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Configuration for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backend that runs the fallback plan
    pub default_backend: String,
    /// Reasoning backend asked for plans
    pub planner_backend: String,
    /// Duration estimate recorded on fallback plans
    pub fallback_plan_minutes: u32,
    /// Whole-plan deadline (None = no deadline)
    pub run_deadline: Option<Duration>,
    /// Concurrency and timeouts
    pub budget: Budget,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_backend: "mistral-large".to_string(),
            planner_backend: "orchestrator".to_string(),
            fallback_plan_minutes: 10,
            run_deadline: None,
            budget: Budget::default(),
        }
    }
}

impl EngineConfig {
    /// Set the fallback plan's backend.
    pub fn with_default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = backend.into();
        self
    }

    /// Set the reasoning backend.
    pub fn with_planner_backend(mut self, backend: impl Into<String>) -> Self {
        self.planner_backend = backend.into();
        self
    }

    /// Set the whole-plan deadline.
    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    /// Set the budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }
}

/// What to execute.
#[derive(Debug, Clone)]
pub enum PlanSource {
    /// Plan JSON as returned by the reasoning backend
    Raw {
        /// Domain the plan is for
        domain: String,
        /// Response body
        body: Vec<u8>,
    },
    /// A plan that already passed validation
    Validated(Plan),
}

impl PlanSource {
    /// Raw plan JSON for a domain.
    pub fn raw(domain: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        PlanSource::Raw {
            domain: domain.into(),
            body: body.into(),
        }
    }
}

/// The execution engine.
///
/// Runs one plan per call:
/// ```text
/// Validate → Resolve waves → Dispatch wave by wave → Aggregate
/// ```
/// Invalid or cyclic plans are replaced by a single-step fallback plan.
pub struct ExecutionEngine {
    registry: Arc<BackendRegistry>,
    dispatcher: Arc<StepDispatcher>,
    resolver: DependencyResolver,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Create an engine over a registry and a completion client.
    pub fn new(registry: Arc<BackendRegistry>, client: Arc<dyn CompletionClient>) -> Self {
        info!(backends = ?registry.names().collect::<Vec<_>>(), "Execution engine initialized");

        Self {
            dispatcher: Arc::new(StepDispatcher::new(client, registry.clone())),
            registry,
            resolver: DependencyResolver::new(),
            config: EngineConfig::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The registry this engine dispatches against.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a plan with the configured deadline.
    ///
    /// Always returns a result for every step unless an internal invariant
    /// breaks; callers inspect `failed` on each step.
    pub async fn execute(&self, source: PlanSource, context: &Context) -> Result<ExecutionResult> {
        self.execute_with_deadline(source, context, self.config.run_deadline)
            .await
    }

    /// Execute a plan, cancelling whatever is unfinished after `deadline`.
    pub async fn execute_with_deadline(
        &self,
        source: PlanSource,
        context: &Context,
        deadline: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let (plan, fallback_plan) = self.accept(source);
        self.run(plan, fallback_plan, context, deadline).await
    }

    /// Ask the reasoning backend for a plan, then execute it.
    pub async fn plan_and_execute(
        &self,
        task_type: &str,
        domain: &str,
        context: &Context,
    ) -> Result<ExecutionResult> {
        let planner = Planner::new(
            &self.dispatcher,
            &self.registry,
            &self.config.planner_backend,
            self.config.budget.timeout_for(Priority::Normal),
        );

        match planner.request_plan(task_type, domain, context).await {
            Ok(raw) => self.execute(PlanSource::raw(domain, raw), context).await,
            Err(e) => {
                warn!(error = %e, "Planning call failed, using fallback plan");
                let plan = self.fallback_plan(domain);
                let reason = FallbackPlanReason::PlannerUnavailable(e.to_string());
                self.run(plan, Some(reason), context, self.config.run_deadline)
                    .await
            }
        }
    }

    /// Validate a plan source and compute its waves.
    ///
    /// Falls back to the single-step plan on schema or cycle errors.
    pub fn prepare(&self, source: PlanSource) -> (Plan, Vec<Wave>, Option<FallbackPlanReason>) {
        let (plan, fallback_plan) = self.accept(source);
        let (plan, waves, cycle) = self.resolve_or_fallback(plan);
        (plan, waves, cycle.or(fallback_plan))
    }

    fn accept(&self, source: PlanSource) -> (Plan, Option<FallbackPlanReason>) {
        match source {
            PlanSource::Validated(plan) => (plan, None),
            PlanSource::Raw { domain, body } => {
                let task_id = TaskId::for_domain(&domain, chrono::Utc::now());
                match validate(&body, task_id, &domain, &self.registry) {
                    Ok(plan) => {
                        info!(task_id = %plan.task_id(), steps = plan.steps().len(), "Execution plan created");
                        (plan, None)
                    }
                    Err(e) => {
                        warn!(error = %e, "Plan parsing failed, using fallback plan");
                        (self.fallback_plan(&domain), Some(FallbackPlanReason::Schema(e.to_string())))
                    }
                }
            }
        }
    }

    fn resolve_or_fallback(&self, plan: Plan) -> (Plan, Vec<Wave>, Option<FallbackPlanReason>) {
        match self.resolver.resolve(&plan) {
            Ok(waves) => (plan, waves, None),
            Err(e) => {
                warn!(task_id = %plan.task_id(), error = %e, "Plan is cyclic, using fallback plan");
                let fallback = self.fallback_plan(plan.domain());
                // One step, no inputs from other steps: a single wave.
                let waves = vec![fallback.steps().iter().map(Step::key).collect()];
                (fallback, waves, Some(FallbackPlanReason::CyclicDependency(e.to_string())))
            }
        }
    }

    fn fallback_plan(&self, domain: &str) -> Plan {
        Plan::fallback(
            TaskId::fallback_for_domain(domain, chrono::Utc::now()),
            domain,
            &self.config.default_backend,
            self.config.fallback_plan_minutes,
        )
    }

    async fn run(
        &self,
        plan: Plan,
        fallback_plan: Option<FallbackPlanReason>,
        context: &Context,
        deadline: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let (plan, waves, cycle) = self.resolve_or_fallback(plan);
        let fallback_plan = cycle.or(fallback_plan);

        let run_id = RunId::new();
        let span = info_span!("run", %run_id, task_id = %plan.task_id());
        let deadline = deadline.map(|d| tokio::time::Instant::now() + d);

        async move {
            info!(steps = plan.steps().len(), waves = waves.len(), "Executing plan");

            let coordinator = Coordinator::new(self.dispatcher.clone(), self.config.budget);
            let plan = Arc::new(plan);
            let results = coordinator
                .run(plan.clone(), &waves, Arc::new(context.clone()), deadline)
                .await?;

            let failed = results.values().filter(|r| r.failed).count();
            info!(steps = results.len(), failed, "Plan execution complete");

            Ok(ExecutionResult {
                run_id,
                task_id: plan.task_id().clone(),
                domain: plan.domain().to_string(),
                results,
                fallback_plan,
                completed_at: chrono::Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}
