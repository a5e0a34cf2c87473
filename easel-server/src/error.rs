use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::{prelude::BASE64_STANDARD, Engine};
use easel_core::{ConfigError, GenerationError, StoreError};
use serde_json::json;

/// Handler error. Maps domain failures onto status codes and a JSON body.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Generation(err) => match err {
                GenerationError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                GenerationError::Busy => (StatusCode::CONFLICT, "BUSY", err.to_string()),
                GenerationError::Cancelled => (StatusCode::CONFLICT, "CANCELLED", err.to_string()),
                GenerationError::Resource(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "RESOURCE_UNAVAILABLE",
                    err.to_string(),
                ),
                GenerationError::Transport(_) => {
                    (StatusCode::BAD_GATEWAY, "DOWNLOAD_FAILED", err.to_string())
                }
                GenerationError::Pipeline { .. } => {
                    tracing::error!(error = %err, "Pipeline error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "PIPELINE_ERROR",
                        err.to_string(),
                    )
                }
                GenerationError::Store { source, unsaved } => {
                    tracing::error!(error = %source, "Generated image could not be saved");
                    // Hand the pixels back anyway.
                    let body = json!({
                        "error": err.to_string(),
                        "code": "STORE_ERROR",
                        "seed": unsaved.request.seed,
                        "mime_type": unsaved.request.output_format.mime_type(),
                        "image": BASE64_STANDARD.encode(&unsaved.encoded),
                    });
                    return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
                }
            },

            AppError::Store(err) => {
                tracing::error!(error = %err, "History store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_ERROR",
                    "An internal error occurred".to_string(),
                )
            }

            AppError::Config(err) => {
                tracing::error!(error = %err, "Settings reload failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    err.to_string(),
                )
            }

            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{what} not found"),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
