//! Backend registry: the named completion services a plan can target.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Errors raised while building or loading a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry file is not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Two backends share a name
    #[error("duplicate backend: {0}")]
    Duplicate(String),

    /// Backend entry is unusable
    #[error("invalid backend '{name}': {reason}")]
    Invalid {
        /// Backend name
        name: String,
        /// What is wrong with it
        reason: String,
    },
}

/// A named remote completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    /// Unique name, referenced by plan steps
    pub name: String,

    /// Base URL of the OpenAI-compatible API, e.g. `http://llama-service:8000/v1`
    pub address: String,

    /// Model identifier sent with each request
    pub model: String,

    /// What this backend is good at (shown to the reasoning backend)
    pub specialization: String,

    /// Relative cost used for prioritization
    #[serde(default)]
    pub cost_weight: f64,
}

impl Backend {
    /// Create a backend with zero cost weight.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        model: impl Into<String>,
        specialization: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            model: model.into(),
            specialization: specialization.into(),
            cost_weight: 0.0,
        }
    }

    /// Endpoint for chat-style completions.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.address.trim_end_matches('/'))
    }

    fn check(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("empty name"));
        }
        if !(self.address.starts_with("http://") || self.address.starts_with("https://")) {
            return Err(invalid("address must be an http(s) URL"));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("empty model"));
        }
        Ok(())
    }
}

/// Immutable mapping of backend name to backend.
///
/// Loaded once at process start and shared read-only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Backend>,
}

impl BackendRegistry {
    /// Build a registry, rejecting duplicate or malformed entries.
    pub fn from_backends(backends: impl IntoIterator<Item = Backend>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for backend in backends {
            backend.check()?;
            if map.contains_key(&backend.name) {
                return Err(RegistryError::Duplicate(backend.name));
            }
            map.insert(backend.name.clone(), backend);
        }
        Ok(Self { backends: map })
    }

    /// Load a registry from a JSON array of backends.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a registry from a JSON array of backends.
    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let backends: Vec<Backend> = serde_json::from_str(content)?;
        Self::from_backends(backends)
    }

    /// The development defaults: one planner and three workers.
    pub fn builtin() -> Self {
        let backends = [
            Backend::new("orchestrator", "http://orchestrator-service:8000/v1", "mistral-small", "planning"),
            Backend::new("mistral-large", "http://mistral-large-service:8000/v1", "mistral-large", "complex_generation"),
            Backend::new("deepseek-r1", "http://deepseek-service:8000/v1", "deepseek-r1", "technical_validation"),
            Backend::new("llama-3-3", "http://llama-service:8000/v1", "llama-3.3", "synthesis"),
        ];

        Self {
            backends: backends.into_iter().map(|b| (b.name.clone(), b)).collect(),
        }
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Option<&Backend> {
        self.backends.get(name)
    }

    /// Whether a backend with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Backend names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// All backends in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.values()
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
