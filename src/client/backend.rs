//! Backend access for UI consumers.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::analysis::AnalysisStatus;
use crate::chat::{ChatRequest, ChatResponse};
use crate::connection::HealthCheck;
use crate::error::{CopilotError, Result};
use crate::server::{
    ConnectRequest, ConnectResponse, DisconnectRequest, ErrorBody, StartAnalysisRequest,
    StartAnalysisResponse, SuccessResponse,
};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Calls the copilot service makes available to a UI.
#[async_trait]
pub trait CopilotBackend: Send + Sync {
    async fn connect(&self, connection_id: i64) -> Result<ConnectResponse>;

    async fn disconnect(&self, session_id: &str) -> Result<()>;

    async fn check_health(&self, session_id: &str) -> Result<HealthCheck>;

    /// Runs one chat turn. Dropping the future abandons the request.
    async fn query(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn start_analysis(&self, session_id: &str) -> Result<StartAnalysisResponse>;

    async fn analysis_status(&self, session_id: &str) -> Result<AnalysisStatus>;

    /// Returns whether a running job was found and cancelled.
    async fn cancel_analysis(&self, session_id: &str) -> Result<bool>;
}

/// Talks to a running service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    /// Client for the service at `base_url` with the default request timeout.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Fails with a config error when the URL does not parse or cannot carry paths.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| CopilotError::config(format!("Invalid service URL '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(CopilotError::config(format!(
                "Service URL '{base_url}' cannot carry paths"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CopilotError::connection(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, base })
    }

    /// Appends escaped path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CopilotError::config("Service URL cannot carry paths"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<R: DeserializeOwned>(&self, segments: &[&str]) -> Result<R> {
        let url = self.endpoint(segments)?;
        debug!(%url, "GET");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CopilotError::connection(format!("Request failed: {e}")))?;
        Self::decode(response).await
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<R> {
        let url = self.endpoint(segments)?;
        debug!(%url, "POST");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CopilotError::connection(format!("Request failed: {e}")))?;
        Self::decode(response).await
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CopilotError::connection(format!("Failed to read response: {e}")))?;

        if status == StatusCode::BAD_REQUEST {
            let error = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(CopilotError::query(format!("Request rejected: {error}")));
        }
        if !status.is_success() {
            return Err(CopilotError::connection(format!(
                "Service returned {status}: {body}"
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| CopilotError::internal(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl CopilotBackend for HttpBackend {
    async fn connect(&self, connection_id: i64) -> Result<ConnectResponse> {
        self.post(&["connections", "connect"], &ConnectRequest { connection_id })
            .await
    }

    async fn disconnect(&self, session_id: &str) -> Result<()> {
        let _: SuccessResponse = self
            .post(
                &["connections", "disconnect"],
                &DisconnectRequest {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn check_health(&self, session_id: &str) -> Result<HealthCheck> {
        self.get(&["connections", "health", session_id]).await
    }

    async fn query(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.post(&["query"], request).await
    }

    async fn start_analysis(&self, session_id: &str) -> Result<StartAnalysisResponse> {
        self.post(
            &["analysis", "start"],
            &StartAnalysisRequest {
                connection_session_id: session_id.to_string(),
            },
        )
        .await
    }

    async fn analysis_status(&self, session_id: &str) -> Result<AnalysisStatus> {
        self.get(&["analysis", "status", session_id]).await
    }

    async fn cancel_analysis(&self, session_id: &str) -> Result<bool> {
        let response: SuccessResponse = self
            .post(&["analysis", "cancel", session_id], &serde_json::Value::Null)
            .await?;
        Ok(response.success)
    }
}
