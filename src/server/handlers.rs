use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::extract::{ApiError, ApiJson};
use super::AppState;
use crate::analysis::AnalysisStatus;
use crate::chat::{resolution_message, resolve_connection, ChatRequest, ChatResponse};
use crate::connection::HealthCheck;
use crate::db::ReadOnlyStatus;
use crate::error::ErrorCode;
use crate::safety::Validation;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /connections/connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub connection_id: i64,
}

/// Reply to a connect. `session_id` is set only on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub read_only_status: ReadOnlyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /connections/disconnect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Body of `POST /query/execute`. A session id wins over a bare connection id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub connection_session_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<i64>,
    pub sql: String,
}

/// Body of `POST /query/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub data: Validation,
}

/// Body of `POST /analysis/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisRequest {
    pub connection_session_id: String,
}

/// Reply to a start; `data` holds the initial status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AnalysisStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

// ============================================================================
// Handlers
// ============================================================================

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub(super) async fn query(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.natural_language.trim().is_empty() {
        return Err(ApiError::bad_request("naturalLanguage must not be empty"));
    }

    // Dropped with the request future when the client goes away.
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    let response = state.orchestrator.ask(request, &cancel).await;
    Ok(Json(response))
}

pub(super) async fn execute(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ExecuteRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.sql.trim().is_empty() {
        return Err(ApiError::bad_request("sql must not be empty"));
    }

    let resolved = match resolve_connection(
        state.lifecycle.sessions().as_ref(),
        request.connection_session_id.as_deref(),
        request.connection_id,
    ) {
        Ok(resolved) => resolved,
        Err(code) => {
            return Ok(Json(
                ChatResponse::failure(Some(code), resolution_message(code)).with_sql(request.sql),
            ))
        }
    };

    let executed = state
        .executor
        .execute(resolved.connection_id, &request.sql, false)
        .await;
    Ok(Json(ChatResponse::from_executed(executed)))
}

pub(super) async fn validate(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ValidateRequest>,
) -> Json<ValidateResponse> {
    Json(ValidateResponse {
        success: true,
        data: state.executor.validate(&request.sql),
    })
}

pub(super) async fn connect(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ConnectRequest>,
) -> Json<ConnectResponse> {
    match state.lifecycle.connect(request.connection_id).await {
        Ok(session) => {
            info!(connection_id = request.connection_id, session_id = %session.id, "Connected");
            Json(ConnectResponse {
                success: true,
                session_id: Some(session.id),
                read_only_status: session.read_only,
                error: None,
            })
        }
        Err(e) => {
            warn!(connection_id = request.connection_id, error = %e, "Connect failed");
            Json(ConnectResponse {
                success: false,
                session_id: None,
                read_only_status: ReadOnlyStatus::Unknown,
                error: Some(e.to_string()),
            })
        }
    }
}

pub(super) async fn disconnect(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DisconnectRequest>,
) -> Json<SuccessResponse> {
    let success = state.lifecycle.disconnect(&request.session_id).await;
    Json(SuccessResponse { success })
}

pub(super) async fn check_health(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<HealthCheck> {
    Json(state.lifecycle.check_health(&session_id).await)
}

pub(super) async fn start_analysis(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<StartAnalysisRequest>,
) -> Json<StartAnalysisResponse> {
    let response = match state.analysis.start(&request.connection_session_id) {
        Ok(status) => StartAnalysisResponse {
            success: true,
            data: Some(status),
            error: None,
            error_code: None,
        },
        Err(code) => StartAnalysisResponse {
            success: false,
            data: None,
            error: Some(resolution_message(code).to_string()),
            error_code: Some(code),
        },
    };
    Json(response)
}

pub(super) async fn analysis_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<AnalysisStatus> {
    Json(state.analysis.status(&session_id))
}

pub(super) async fn cancel_analysis(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<SuccessResponse> {
    Json(SuccessResponse {
        success: state.analysis.cancel(&session_id),
    })
}
