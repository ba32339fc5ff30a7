//! Collective core data models.
//!
//! Backends, plans and their steps, and the results an execution run
//! produces. Plans enter the system only through [`validate`] or
//! [`Plan::fallback`].

#![warn(missing_docs)]

mod id;
mod backend;
mod plan;
mod validate;
mod result;

pub use id::{RunId, StepKey, TaskId};
pub use backend::{Backend, BackendRegistry, RegistryError};
pub use plan::{
    parse_step_reference, ActionKind, InputRef, Plan, Priority, SamplingParams, Step,
    FALLBACK_ACTION,
};
pub use validate::{validate, SchemaError};
pub use result::{ExecutionResult, FallbackPlanReason, StepFailure, StepResult};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
