use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::interview::errors::SessionError;
use crate::interview::registry::RegistryError;
use crate::interview::store::StoreError;
use crate::interview::voice::RouteError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Voice service error: {0}")]
    Voice(String),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(format!("Session {id} not found")),
            other => AppError::Store(other),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => AppError::NotFound(format!("Session {id} not found")),
            SessionError::NoQuestions => AppError::Validation(e.to_string()),
            SessionError::InvalidTransition { .. } | SessionError::Conflict => {
                AppError::Conflict(e.to_string())
            }
            SessionError::Connection(inner) => AppError::Voice(inner.to_string()),
            SessionError::Persistence(_)
            | SessionError::Feedback(_)
            | SessionError::ControllerGone => AppError::Internal(anyhow::anyhow!(e.to_string())),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Session(inner) => inner.into(),
            RegistryError::Store(inner) => inner.into(),
            RegistryError::UnknownCall(call_id) => {
                AppError::NotFound(format!("No session for call {call_id}"))
            }
        }
    }
}

impl From<RouteError> for AppError {
    fn from(e: RouteError) -> Self {
        AppError::NotFound(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Voice(msg) => {
                tracing::error!("Voice service error: {msg}");
                (
                    StatusCode::BAD_GATEWAY,
                    "VOICE_CONNECTION_ERROR",
                    "Could not connect to the voice service".to_string(),
                )
            }
            AppError::Store(e) => {
                tracing::error!("Storage error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "A storage error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
