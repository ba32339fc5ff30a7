//! Substitute-backend lookup for failed steps.

use collective_core::Step;
use std::collections::BTreeMap;
use tracing::info;

/// The failed backend has no substitute in the plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no fallback configured for backend {0}")]
pub struct NoFallbackAvailable(pub String);

/// Picks the backend for a step's single retry.
///
/// Fallbacks do not chain: the substitute of a substitute is never used.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackRouter;

impl FallbackRouter {
    /// Create a new router.
    pub fn new() -> Self {
        Self
    }

    /// Substitute for `original_backend` according to the plan's fallback map.
    pub fn route<'a>(
        &self,
        step: &Step,
        original_backend: &str,
        fallback: &'a BTreeMap<String, String>,
    ) -> Result<&'a str, NoFallbackAvailable> {
        let substitute = fallback
            .get(original_backend)
            .ok_or_else(|| NoFallbackAvailable(original_backend.to_string()))?;

        info!(
            step = step.index,
            from = original_backend,
            to = %substitute,
            "Attempting fallback"
        );
        Ok(substitute.as_str())
    }
}
