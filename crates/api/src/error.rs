//! API error types and their HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ledgerlink_reconcile::ReconcileError;
use serde_json::json;

use crate::auth::StateStoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// QuickBooks rejected or failed a call made on the user's behalf
    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Upstream timeout")]
    GatewayTimeout,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::AuthExchange(msg) => {
                ApiError::BadGateway(format!("QuickBooks authorization failed: {}", msg))
            }
            ReconcileError::AuthRefresh(msg) => {
                ApiError::BadGateway(format!("QuickBooks token refresh failed: {}", msg))
            }
            ReconcileError::Fetch { .. } => ApiError::BadGateway(err.to_string()),
            ReconcileError::NotConnected(_) => ApiError::ServiceUnavailable(err.to_string()),
            ReconcileError::Timeout(_) => ApiError::GatewayTimeout,
            ReconcileError::Config(msg) => ApiError::Config(msg),
            ReconcileError::Store(_) | ReconcileError::Decode { .. } | ReconcileError::Recalc { .. } => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<StateStoreError> for ApiError {
    fn from(err: StateStoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::GatewayTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "QuickBooks did not respond in time".to_string(),
            ),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Config(_) | ApiError::Internal(_) => {
                tracing::error!(error = %self, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
