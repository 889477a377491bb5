use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes the collaborator reports in an error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    /// Missing or stale anti-forgery token.
    Forbidden,
    NotFound,
    Validation,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 422 => Self::Validation,
            _ => Self::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from a non-success response, preferring a structured
    /// body and falling back to the raw text.
    pub fn from_response(status: u16, body: &str) -> Self {
        serde_json::from_str::<ApiError>(body).unwrap_or_else(|_| {
            let body = body.trim();
            let message = if body.is_empty() {
                format!("http status {status}")
            } else {
                body.to_string()
            };
            Self::new(ErrorCode::from_status(status), message)
        })
    }
}
