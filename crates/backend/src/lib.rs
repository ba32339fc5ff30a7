//! Completion backends.
//!
//! The engine talks to every backend through [`CompletionClient`]; the
//! HTTP implementation speaks the OpenAI-compatible chat API served by vLLM.

#![warn(missing_docs)]

pub mod client;
pub mod http;

pub use client::{
    BackendFailure, ChatCompletionResponse, ChatMessage, CompletionClient, CompletionRequest,
};
pub use http::HttpCompletionClient;
