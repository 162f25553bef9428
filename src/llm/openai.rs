//! OpenAI chat completions client.
//!
//! Works against any OpenAI-compatible endpoint via `base_url`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CopilotError, Result};
use crate::llm::types::Message;
use crate::llm::LlmClient;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    /// Config against the public endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Points at a compatible endpoint. Trailing slashes are trimmed.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Reads `OPENAI_API_KEY` and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| CopilotError::llm("OPENAI_API_KEY environment variable not set"))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(api_key, model))
    }
}

/// OpenAI LLM client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    /// Builds the HTTP client with the configured timeout.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CopilotError::llm(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    /// Maps an error response to (error, is_retryable).
    fn parse_error(status: StatusCode, body: &str) -> (CopilotError, bool) {
        match status {
            StatusCode::UNAUTHORIZED => (
                CopilotError::llm("Authentication failed. Check your OPENAI_API_KEY."),
                false,
            ),
            StatusCode::TOO_MANY_REQUESTS => (
                CopilotError::llm("Rate limited. Please wait and try again."),
                true,
            ),
            _ => {
                let message = serde_json::from_str::<ErrorResponse>(body)
                    .map(|e| format!("OpenAI API error: {}", e.error.message))
                    .unwrap_or_else(|_| format!("OpenAI API error ({status}): {body}"));
                (CopilotError::llm(message), status.is_server_error())
            }
        }
    }

    fn map_request_error(e: &reqwest::Error) -> CopilotError {
        if e.is_timeout() {
            CopilotError::llm("Request timed out")
        } else if e.is_connect() {
            CopilotError::llm("Failed to connect to the OpenAI API")
        } else {
            CopilotError::llm(format!("Request failed: {e}"))
        }
    }

    async fn send_once(&self, request: &ChatRequest<'_>) -> std::result::Result<String, (CopilotError, bool)> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| (Self::map_request_error(&e), e.is_timeout() || e.is_connect()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| (CopilotError::llm(format!("Failed to read response: {e}")), false))?;

        if !status.is_success() {
            return Err(Self::parse_error(status, &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| (CopilotError::llm(format!("Failed to parse response: {e}")), false))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| (CopilotError::llm("No response from OpenAI"), false))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message], model: Option<&str>) -> Result<String> {
        let request = ChatRequest {
            model: model.unwrap_or(&self.config.model),
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
        };

        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;
        loop {
            debug!(attempt, model = request.model, "OpenAI request");
            match self.send_once(&request).await {
                Ok(content) => return Ok(content),
                Err((error, retryable)) if retryable && attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(attempt, error = %error, "OpenAI request failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err((error, _)) => return Err(error),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}
