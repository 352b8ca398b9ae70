use axum::response::{IntoResponse, Response};
use axum_helpers::AppError;
use serde::Serialize;
use std::time::Duration;
use strum::Display;
use thiserror::Error;

use crate::engine::EngineError;
use crate::store::StoreError;

/// Distinguishable failure categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    RateLimited,
    Overloaded,
    NotFound,
    Conflict,
    EngineFailure,
    Cancelled,
    Validation,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Overloaded: {reason}")]
    Overloaded {
        reason: String,
        retry_after: Duration,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    Validation(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Backoff hint when the metadata store stays unavailable after retries.
pub const STORE_RETRY_AFTER: Duration = Duration::from_secs(1);

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            GatewayError::Forbidden(_) => ErrorKind::Forbidden,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::Overloaded { .. } => ErrorKind::Overloaded,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Conflict(_) => ErrorKind::Conflict,
            GatewayError::EngineFailure(_) => ErrorKind::EngineFailure,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Backoff hint for retryable kinds.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after }
            | GatewayError::Overloaded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn unauthenticated() -> Self {
        GatewayError::Unauthenticated("invalid or missing credential".to_string())
    }
}

/// A metadata store outage surfaces as backpressure, never as a leaked
/// internal error.
impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Metadata store failure");
        GatewayError::Overloaded {
            reason: "metadata store unavailable".to_string(),
            retry_after: STORE_RETRY_AFTER,
        }
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

/// Convert GatewayError to AppError for standardized error responses
impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthenticated(msg) => AppError::Unauthorized(msg),
            GatewayError::Forbidden(msg) => AppError::Forbidden(msg),
            GatewayError::RateLimited { retry_after } => AppError::TooManyRequests {
                message: "Rate limit exceeded".to_string(),
                retry_after,
            },
            GatewayError::Overloaded {
                reason,
                retry_after,
            } => AppError::ServiceUnavailable {
                message: reason,
                retry_after: Some(retry_after),
            },
            GatewayError::NotFound(msg) => AppError::NotFound(msg),
            GatewayError::Conflict(msg) => AppError::Conflict(msg),
            GatewayError::EngineFailure(e) => AppError::BadGateway(e.to_string()),
            GatewayError::Cancelled => AppError::Cancelled("request cancelled".to_string()),
            GatewayError::Validation(msg) => AppError::BadRequest(msg),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let app_error: AppError = self.into();
        app_error.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, header::RETRY_AFTER};

    #[test]
    fn test_kinds_are_distinct() {
        let errors = [
            GatewayError::unauthenticated(),
            GatewayError::Forbidden("x".into()),
            GatewayError::RateLimited {
                retry_after: Duration::from_millis(10),
            },
            GatewayError::Overloaded {
                reason: "x".into(),
                retry_after: Duration::from_secs(1),
            },
            GatewayError::NotFound("x".into()),
            GatewayError::Conflict("x".into()),
            GatewayError::EngineFailure(EngineError::Unavailable("x".into())),
            GatewayError::Cancelled,
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_store_failure_maps_to_overloaded() {
        let err: GatewayError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert!(err.retry_after().is_some());
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = GatewayError::RateLimited {
            retry_after: Duration::from_millis(1500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (GatewayError::unauthenticated(), StatusCode::UNAUTHORIZED),
            (GatewayError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (GatewayError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (GatewayError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                GatewayError::EngineFailure(EngineError::Rejected("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (GatewayError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                GatewayError::Overloaded {
                    reason: "x".into(),
                    retry_after: Duration::from_secs(1),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
