//! Execution layer - dependency resolution, dispatch, and aggregation.

#![warn(missing_docs)]

pub mod aggregator;
pub mod dependency;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod planner;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use aggregator::{DuplicateResultError, ResultAggregator};
pub use dependency::{CyclicDependencyError, DependencyResolver, Wave};
pub use dispatcher::{BackendCallFailed, Context, StepDispatcher};
pub use engine::{EngineConfig, ExecutionEngine, PlanSource};
pub use error::{EngineError, Result};
pub use fallback::{FallbackRouter, NoFallbackAvailable};
pub use planner::Planner;
pub use scheduler::{Budget, Coordinator, RunState};
