//! LLM client factory.
//!
//! Centralizes provider-specific setup for creating a client from config.

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::{CopilotError, Result};
use crate::llm::{
    LlmClient, LlmProvider, MockLlmClient, OllamaClient, OllamaConfig, OpenAiClient, OpenAiConfig,
};

/// Creates the configured client, or `None` when the AI backend is disabled.
///
/// Environment variables fill in what the config leaves out:
/// - `OPENAI_API_KEY` (required for openai) and `OPENAI_MODEL`
/// - `OLLAMA_URL` and `OLLAMA_MODEL`
pub fn create_client(config: &LlmConfig) -> Result<Option<Arc<dyn LlmClient>>> {
    let provider: LlmProvider = config.provider.parse().map_err(CopilotError::config)?;

    let client: Arc<dyn LlmClient> = match provider {
        LlmProvider::Disabled => return Ok(None),
        LlmProvider::OpenAi => {
            let mut openai = OpenAiConfig::from_env()
                .map_err(|_| {
                    CopilotError::llm("No API key configured. Set OPENAI_API_KEY.")
                })?
                .with_timeout(config.timeout_secs);
            if let Some(model) = &config.model {
                openai.model = model.clone();
            }
            if let Some(base_url) = &config.base_url {
                openai = openai.with_base_url(base_url.clone());
            }
            Arc::new(OpenAiClient::new(openai)?)
        }
        LlmProvider::Ollama => {
            let mut ollama = OllamaConfig::from_env().with_timeout(config.timeout_secs);
            if let Some(model) = &config.model {
                ollama.model = model.clone();
            }
            if let Some(base_url) = &config.base_url {
                ollama = ollama.with_url(base_url.clone());
            }
            Arc::new(OllamaClient::new(ollama)?)
        }
        LlmProvider::Mock => Arc::new(MockLlmClient::new()),
    };

    Ok(Some(client))
}
