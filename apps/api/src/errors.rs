use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::chat::ChatError;
use crate::document::DocumentError;
use crate::version::VersionError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Reset failed: {0}")]
    ResetFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<DocumentError> for AppError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::BuildFailed { ref source, .. } => {
                tracing::warn!("Build failed: {source}");
                AppError::BuildFailed(e.to_string())
            }
            DocumentError::NotReady(_) => AppError::NotReady(e.to_string()),
            DocumentError::ResetFailed(_) => AppError::ResetFailed(e.to_string()),
            DocumentError::Version(VersionError::UnknownCheckpoint(id)) => {
                AppError::NotFound(format!("Checkpoint {id} not found"))
            }
            DocumentError::Version(VersionError::AmbiguousCheckpoint(id)) => {
                AppError::Validation(format!("Checkpoint id '{id}' is ambiguous"))
            }
            DocumentError::ExpressionFailed { reason, .. } => AppError::Validation(reason),
            DocumentError::Serialization(_) => AppError::Internal(anyhow::Error::new(e)),
            other => AppError::Storage(other.to_string()),
        }
    }
}

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Busy => AppError::Conflict(e.to_string()),
            ChatError::Document(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::BuildFailed(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "BUILD_FAILED", msg.clone())
            }
            AppError::NotReady(msg) => (StatusCode::CONFLICT, "NOT_READY", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::ResetFailed(msg) => {
                tracing::error!("Reset failed: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "RESET_FAILED",
                    "Could not delete the document store, please try again".to_string(),
                )
            }
            AppError::Storage(msg) => {
                tracing::error!("Storage error: {msg}");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileError;

    #[test]
    fn test_document_errors_map_to_statuses() {
        let cases = [
            (
                DocumentError::BuildFailed {
                    path: "/template.yml".to_string(),
                    source: CompileError::Render("raw compiler output".to_string()),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (DocumentError::NotReady("compiler is not loaded"), StatusCode::CONFLICT),
            (
                DocumentError::Version(VersionError::UnknownCheckpoint("abcd".to_string())),
                StatusCode::NOT_FOUND,
            ),
            (
                DocumentError::Version(VersionError::NotInitialized),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn test_build_failure_message_hides_compiler_output() {
        let error = AppError::from(DocumentError::BuildFailed {
            path: "/template.yml".to_string(),
            source: CompileError::Render("raw compiler output".to_string()),
        });
        assert!(!error.to_string().contains("raw compiler output"));
    }

    #[test]
    fn test_busy_chat_is_a_conflict() {
        let response = AppError::from(ChatError::Busy).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
