//! Completion client abstraction and chat wire types.

use async_trait::async_trait;
use collective_core::{Backend, SamplingParams};
use serde::{Deserialize, Serialize};

/// Every way a backend call can fail.
///
/// The engine treats all of these alike; the variants exist for logs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendFailure {
    /// Step names a backend that is not registered
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Connection or protocol error
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Response did not contain completion text
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// No response within the dispatch timeout
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Body of a chat completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    /// Model identifier
    pub model: String,
    /// Conversation, a single user message in practice
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    pub temperature: f32,
    /// Token limit
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Single-prompt request for a backend.
    pub fn new(backend: &Backend, prompt: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            model: backend.model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        }
    }

    /// Text of the last message.
    pub fn prompt(&self) -> &str {
        self.messages.last().map(|m| m.content.as_str()).unwrap_or_default()
    }
}

/// Body of a chat completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    /// Completion choices
    pub choices: Vec<Choice>,
}

/// One completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// Generated message
    pub message: ChoiceMessage,
}

/// Message inside a choice.
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    /// Generated text
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first choice.
    pub fn into_text(self) -> Result<String, BackendFailure> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendFailure::MalformedResponse("no completion text in choices".to_string()))
    }
}

/// A chat-style completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send one request to a backend and return the completion text.
    async fn complete(&self, backend: &Backend, request: &CompletionRequest) -> Result<String, BackendFailure>;
}
