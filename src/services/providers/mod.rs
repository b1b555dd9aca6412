//! Model-provider abstraction: the external collaborator the gateway
//! forwards admitted calls to.
//!
//! The quota subsystem only needs two things back from a provider: the
//! response content and the actual token counts for reconciliation.

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// One turn of a chat conversation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Result of a completed provider call, including the actual token usage the
/// reconciler corrects the window counters with.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Trait for chat-completion providers (OpenAI-compatible, mock).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Execute one chat completion.
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<i64>,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}
