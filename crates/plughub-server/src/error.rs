//! Unified error handling for the API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use plughub_core::{DistributionError, PluginSystemError};

/// API error response body
#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

/// Application error types
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
    Plugin(PluginSystemError),
    Distribution(DistributionError),
}

impl AppError {
    fn parts(self) -> (StatusCode, String, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND".into(), msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST".into(), msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN".into(), msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT".into(), msg),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR".into(),
                msg,
            ),
            AppError::Plugin(PluginSystemError::Distribution(err)) => {
                AppError::Distribution(err).parts()
            }
            AppError::Plugin(err) => {
                let status = plugin_status(&err);
                (status, err.code().as_str().to_string(), err.to_string())
            }
            AppError::Distribution(err) => {
                let (status, code) = distribution_status(&err);
                (status, code.to_string(), err.to_string())
            }
        }
    }
}

fn plugin_status(err: &PluginSystemError) -> StatusCode {
    match err {
        PluginSystemError::Validation { .. } => StatusCode::BAD_REQUEST,
        PluginSystemError::Permission { .. } => StatusCode::FORBIDDEN,
        PluginSystemError::NotFound(_) => StatusCode::NOT_FOUND,
        PluginSystemError::Collision { .. } | PluginSystemError::InvalidState { .. } => {
            StatusCode::CONFLICT
        }
        PluginSystemError::Initialization { .. } | PluginSystemError::Routing { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PluginSystemError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PluginSystemError::HealthCheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PluginSystemError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PluginSystemError::Distribution(err) => distribution_status(err).0,
    }
}

fn distribution_status(err: &DistributionError) -> (StatusCode, &'static str) {
    match err {
        DistributionError::InvalidKey { .. } => (StatusCode::BAD_REQUEST, "INVALID_ARTIFACT_KEY"),
        DistributionError::InvalidArchive(_) => (StatusCode::BAD_REQUEST, "INVALID_ARCHIVE"),
        DistributionError::NotFound(_) => (StatusCode::NOT_FOUND, "ARTIFACT_NOT_FOUND"),
        DistributionError::PushConflict { .. } => (StatusCode::CONFLICT, "ARTIFACT_CONFLICT"),
        DistributionError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "DISTRIBUTION_TIMEOUT"),
        DistributionError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DISTRIBUTION_CONFIG"),
        _ => (StatusCode::BAD_GATEWAY, "DISTRIBUTION_ERROR"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), code = %code, "{}", message);
        }

        (
            status,
            Json(ApiError {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

impl From<PluginSystemError> for AppError {
    fn from(err: PluginSystemError) -> Self {
        AppError::Plugin(err)
    }
}

impl From<DistributionError> for AppError {
    fn from(err: DistributionError) -> Self {
        AppError::Distribution(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Log full error chain for debugging, return sanitized message to client
        tracing::error!("Internal error: {:?}", err);
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}
