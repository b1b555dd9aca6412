//! Mock provider implementation for testing and local runs.

use super::{ChatMessage, ChatProvider, ProviderError, ProviderResponse};
use async_trait::async_trait;

/// Mock chat provider returning canned completions with deterministic usage.
pub struct MockChatProvider {
    enabled: bool,
}

impl MockChatProvider {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn complete(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<i64>,
    ) -> Result<ProviderResponse, ProviderError> {
        if !self.enabled {
            return Err(ProviderError::NotConfigured(
                "Mock chat provider not enabled".to_string(),
            ));
        }

        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let last = messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        Ok(ProviderResponse {
            text: format!("Mock response for: {}", last),
            input_tokens: (prompt_chars as i64) / 4,
            output_tokens: max_tokens.unwrap_or(10).min(10),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.enabled {
            Ok(())
        } else {
            Err(ProviderError::NotConfigured(
                "Mock chat provider not enabled".to_string(),
            ))
        }
    }
}
