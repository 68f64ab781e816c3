//! Error taxonomy for the gateway
//!
//! Extraction engines and subsystems raise typed errors; the HTTP layer maps
//! them onto status codes with a stable `{ "detail": .., "code": .. }` JSON
//! body. Background render failures never reach the original requester —
//! they surface to whichever media fetch awaits the completion event.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error conditions raised by extraction engines and subsystems
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed caller input
    #[error("{0}")]
    Validation(String),

    /// Missing/invalid token or blocklisted user
    #[error("{0}")]
    Unauthorized(String),

    /// Target resource absent (broken share link, unknown asset)
    #[error("{0}")]
    NotFound(String),

    /// Non-success from a third-party fetch, mapped to the upstream code
    /// when known
    #[error("upstream returned {status}: {detail}")]
    Upstream { status: u16, detail: String },

    /// Deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Unexpected failure; full text lands in the audit record
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn upstream(status: u16, detail: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            detail: detail.into(),
        }
    }
}

/// Stable error body served to callers
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: u16,
}

/// Error text stashed on the response for the audit middleware
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.to_string();
        let body = ErrorBody {
            detail: detail.clone(),
            code: status.as_u16(),
        };
        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(ErrorDetail(detail));
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} preserves the full context chain
        Self::Internal(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        match err.status() {
            Some(status) => Self::Upstream {
                status: status.as_u16(),
                detail: err.to_string(),
            },
            None => Self::Upstream {
                status: 502,
                detail: err.to_string(),
            },
        }
    }
}

impl From<tokio::time::error::Elapsed> for ApiError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout("deadline exceeded".into())
    }
}

/// Convenience alias for Result with `ApiError`
pub type ApiResult<T> = Result<T, ApiError>;
