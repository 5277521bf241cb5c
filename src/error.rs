use crate::engine::{describe_options, EngineOptions};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// One failed construction or invocation step
#[derive(Debug, Clone, Serialize)]
pub struct AttemptFailure {
    /// Name of the attempted configuration (e.g. "filtered", "no-doc-unwarping")
    pub label: String,
    /// Exact option set the step was made with
    pub options: EngineOptions,
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.label,
            describe_options(&self.options),
            self.reason
        )
    }
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum OcrError {
    #[error(
        "Failed to initialize OCR model for language '{language}': {}",
        join_attempts(.attempts)
    )]
    ModelInitializationFailed {
        language: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error(
        "All {} invocation attempts failed on page {page} (language '{language}'): {}",
        .attempts.len(),
        join_attempts(.attempts)
    )]
    InvocationExhausted {
        language: String,
        page: usize,
        attempts: Vec<AttemptFailure>,
    },

    #[error("OCR did not return any text")]
    NoTextProduced,

    #[error("Document had no renderable pages")]
    NoPages,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    ImageTooLarge { size: usize, max: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for OcrError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            OcrError::ModelInitializationFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INIT_ERROR")
            }
            OcrError::InvocationExhausted { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INVOCATION_EXHAUSTED")
            }
            OcrError::NoTextProduced => (StatusCode::UNPROCESSABLE_ENTITY, "NO_TEXT"),
            OcrError::NoPages => (StatusCode::UNPROCESSABLE_ENTITY, "NO_PAGES"),
            OcrError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
            OcrError::UnsupportedFormat(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED_FORMAT"),
            OcrError::ImageTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE"),
            OcrError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            OcrError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}
