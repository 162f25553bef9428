//! LLM integration.
//!
//! The orchestrator and the analysis worker only see [`LlmClient`]; the
//! provider clients here are reference implementations of it.

pub mod factory;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod parser;
pub mod prompt;
pub mod types;

pub use factory::create_client;
pub use mock::MockLlmClient;
pub use ollama::{OllamaClient, OllamaConfig};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use parser::{parse_ai_response, strip_code_fence, AiResponse};
pub use prompt::{build_messages, build_system_prompt, PromptContext};
pub use types::{Conversation, Exchange, Message, Role};

use async_trait::async_trait;
use std::str::FromStr;

use crate::error::Result;

/// Completion client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the model's answer to `messages`.
    ///
    /// `model` overrides the client's configured model for this call.
    async fn complete(&self, messages: &[Message], model: Option<&str>) -> Result<String>;

    /// Whether the backend can currently take requests.
    async fn is_available(&self) -> bool {
        true
    }
}

/// Configured LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Ollama,
    Mock,
    /// No AI backend; every question goes to the pattern matcher.
    Disabled,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
            Self::Disabled => "none",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "mock" => Ok(Self::Mock),
            "none" | "off" | "disabled" => Ok(Self::Disabled),
            _ => Err(format!("Unknown LLM provider: {s}")),
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
