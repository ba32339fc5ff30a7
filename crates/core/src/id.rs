//! Identifiers for plans, runs and steps.

use crate::Time;
use serde::{Deserialize, Serialize, Serializer};
use ulid::Ulid;

/// Identifier of one execution run.
///
/// Every call into the engine gets a fresh run id; it only exists to tie
/// log lines and results of the same run together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Ulid);

impl RunId {
    /// Generate a new RunId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a plan, e.g. `transport_2026-10-18T09:12:44+00:00`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for a plan produced by the reasoning backend.
    pub fn for_domain(domain: &str, at: Time) -> Self {
        Self(format!("{}_{}", domain, at.to_rfc3339()))
    }

    /// Id for a substituted fallback plan.
    pub fn fallback_for_domain(domain: &str, at: Time) -> Self {
        Self(format!("{}_fallback_{}", domain, at.to_rfc3339()))
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a step inside a plan and its result map.
///
/// Displays and serializes as `step_<N>`, which is also how later steps
/// reference its output in their inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey(pub u32);

impl StepKey {
    /// Step index this key refers to.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step_{}", self.0)
    }
}

impl Serialize for StepKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        crate::plan::parse_step_reference(&raw)
            .map(StepKey)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid step key: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_step_key_display() {
        assert_eq!(StepKey(7).to_string(), "step_7");
        assert_eq!(serde_json::to_string(&StepKey(12)).unwrap(), "\"step_12\"");
    }

    #[test]
    fn test_step_key_ordering_is_numeric() {
        let mut keys = vec![StepKey(10), StepKey(2), StepKey(1)];
        keys.sort();
        assert_eq!(keys, vec![StepKey(1), StepKey(2), StepKey(10)]);
    }

    #[test]
    fn test_task_id_formats() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            TaskId::for_domain("transport", at).as_str(),
            "transport_2026-01-02T03:04:05+00:00"
        );
        assert_eq!(
            TaskId::fallback_for_domain("energie", at).as_str(),
            "energie_fallback_2026-01-02T03:04:05+00:00"
        );
    }
}
