//! HTTP completion client for OpenAI-compatible endpoints.

use crate::client::{BackendFailure, ChatCompletionResponse, CompletionClient, CompletionRequest};
use async_trait::async_trait;
use collective_core::Backend;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::{debug, warn};

/// Chat completion client over HTTP.
///
/// Holds one connection pool; create it once per engine and share it.
#[derive(Clone)]
pub struct HttpCompletionClient {
    client: Client,
}

impl HttpCompletionClient {
    /// Create a client with a 10 second connect timeout.
    pub fn new() -> Result<Self, BackendFailure> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a client with a custom connect timeout.
    ///
    /// Overall request time is bounded by the dispatcher, not here.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, BackendFailure> {
        let client = ClientBuilder::new()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendFailure::Transport(format!("building HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, backend: &Backend, request: &CompletionRequest) -> Result<String, BackendFailure> {
        let url = backend.chat_completions_url();
        debug!(backend = %backend.name, %url, "Calling completion endpoint");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| BackendFailure::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(backend = %backend.name, status, "Completion call rejected");
            return Err(BackendFailure::Status { status, body });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendFailure::MalformedResponse(e.to_string()))?;

        body.into_text()
    }
}
