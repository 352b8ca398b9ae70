pub mod codes;
pub mod handlers;

pub use codes::ErrorCode;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use sea_orm::DbErr;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;
use validator::ValidationErrors;

/// JSON body of every error response.
///
/// ```json
/// {
///   "code": 1009,
///   "error": "RATE_LIMITED",
///   "message": "Rate limit exceeded, retry in 2s",
///   "details": { "retry_after_secs": 2 }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Integer error code for logging and monitoring
    pub code: i32,
    /// Machine-readable error identifier
    pub error: String,
    /// Human-readable reason
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error type rendered as an HTTP response.
///
/// Domain crates convert their own errors into this type so that every
/// response shares one body shape and one logging policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    #[error("JSON parsing error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("JSON extraction error: {0}")]
    JsonExtractorRejection(#[from] JsonRejection),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too Many Requests: {message}")]
    TooManyRequests {
        message: String,
        retry_after: Duration,
    },

    #[error("Service Unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Client Closed Request: {0}")]
    Cancelled(String),

    #[error("Internal Server Error: {0}")]
    InternalServerError(String),
}

/// Non-standard status used by proxies for requests the client abandoned.
const CLIENT_CLOSED_REQUEST: u16 = 499;

struct Parts {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    details: Option<serde_json::Value>,
    retry_after: Option<Duration>,
}

impl Parts {
    fn new(status: StatusCode, code: ErrorCode, message: String) -> Self {
        Self {
            status,
            code,
            message,
            details: None,
            retry_after: None,
        }
    }

    fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self.details = Some(serde_json::json!({
            "retry_after_secs": retry_after_secs(retry_after),
        }));
        self
    }
}

/// Whole seconds for the `Retry-After` header, rounded up and at least 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl AppError {
    fn into_parts(self) -> Parts {
        match self {
            AppError::SerdeJson(e) => {
                tracing::error!(error_code = ErrorCode::SerdeJsonError.code(), error = ?e, "JSON processing error");
                Parts::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::SerdeJsonError,
                    ErrorCode::SerdeJsonError.default_message().to_string(),
                )
            }
            AppError::Database(e) => map_db_error(&e),
            AppError::JsonExtractorRejection(e) => {
                tracing::warn!(error_code = ErrorCode::JsonExtraction.code(), error = ?e, "JSON extraction error");
                Parts::new(e.status(), ErrorCode::JsonExtraction, e.body_text())
            }
            AppError::ValidationError(e) => {
                tracing::info!(error_code = ErrorCode::ValidationError.code(), error = ?e, "Validation error");
                Parts::new(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::ValidationError,
                    ErrorCode::ValidationError.default_message().to_string(),
                )
                .details(serde_json::to_value(&e).unwrap_or(serde_json::Value::Null))
            }
            AppError::BadRequest(msg) => {
                tracing::info!("Bad request: {}", msg);
                Parts::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationError, msg)
            }
            AppError::Unauthorized(msg) => {
                tracing::info!("Unauthorized: {}", msg);
                Parts::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, msg)
            }
            AppError::Forbidden(msg) => {
                tracing::info!("Forbidden: {}", msg);
                Parts::new(StatusCode::FORBIDDEN, ErrorCode::Forbidden, msg)
            }
            AppError::NotFound(msg) => {
                tracing::info!(error_code = ErrorCode::NotFound.code(), "Not found: {}", msg);
                Parts::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, msg)
            }
            AppError::Conflict(msg) => {
                tracing::info!("Conflict: {}", msg);
                Parts::new(StatusCode::CONFLICT, ErrorCode::Conflict, msg)
            }
            AppError::TooManyRequests {
                message,
                retry_after,
            } => {
                tracing::info!(retry_after_ms = retry_after.as_millis() as u64, "Rate limited: {}", message);
                Parts::new(StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited, message)
                    .retry_after(retry_after)
            }
            AppError::ServiceUnavailable {
                message,
                retry_after,
            } => {
                tracing::warn!("Service unavailable: {}", message);
                let parts = Parts::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::ServiceUnavailable,
                    message,
                );
                match retry_after {
                    Some(retry_after) => parts.retry_after(retry_after),
                    None => parts,
                }
            }
            AppError::BadGateway(msg) => {
                tracing::error!(error_code = ErrorCode::UpstreamFailure.code(), "Upstream failure: {}", msg);
                Parts::new(StatusCode::BAD_GATEWAY, ErrorCode::UpstreamFailure, msg)
            }
            AppError::Cancelled(msg) => {
                tracing::info!("Request cancelled: {}", msg);
                Parts::new(
                    StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
                    ErrorCode::Cancelled,
                    msg,
                )
            }
            AppError::InternalServerError(msg) => {
                tracing::error!(error_code = ErrorCode::InternalError.code(), "Internal server error: {}", msg);
                Parts::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, msg)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let parts = self.into_parts();

        let body = Json(ErrorResponse {
            code: parts.code.code(),
            error: parts.code.as_str().to_string(),
            message: parts.message,
            details: parts.details,
        });

        let mut response = (parts.status, body).into_response();
        if let Some(retry_after) = parts.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        response
    }
}

fn map_db_error(error: &DbErr) -> Parts {
    match error {
        DbErr::Conn(e) => {
            tracing::error!(error_code = ErrorCode::DatabaseError.code(), error = ?e, "Database connection error");
            Parts::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::ServiceUnavailable,
                ErrorCode::ServiceUnavailable.default_message().to_string(),
            )
        }
        DbErr::ConnectionAcquire(e) => {
            tracing::warn!(error_code = ErrorCode::DatabasePoolTimeout.code(), error = ?e, "Database pool exhausted");
            Parts::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::DatabasePoolTimeout,
                ErrorCode::DatabasePoolTimeout.default_message().to_string(),
            )
        }
        DbErr::RecordNotFound(msg) => {
            tracing::info!(error_code = ErrorCode::NotFound.code(), "Record not found: {}", msg);
            Parts::new(
                StatusCode::NOT_FOUND,
                ErrorCode::NotFound,
                ErrorCode::NotFound.default_message().to_string(),
            )
        }
        _ => {
            tracing::error!(error_code = ErrorCode::DatabaseError.code(), error = ?error, "Database error");
            Parts::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::DatabaseError,
                ErrorCode::DatabaseError.default_message().to_string(),
            )
        }
    }
}

/// Error response with the code's identifier and a custom message.
pub fn error_response(status: StatusCode, message: String, error_code: ErrorCode) -> Response {
    let body = Json(ErrorResponse {
        code: error_code.code(),
        error: error_code.as_str().to_string(),
        message,
        details: None,
    });

    (status, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_too_many_requests_sets_retry_after() {
        let response = AppError::TooManyRequests {
            message: "slow down".to_string(),
            retry_after: Duration::from_millis(1500),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "2");

        let json = body_json(response).await;
        assert_eq!(json["error"], "RATE_LIMITED");
        assert_eq!(json["details"]["retry_after_secs"], 2);
    }

    #[tokio::test]
    async fn test_service_unavailable_without_hint() {
        let response = AppError::ServiceUnavailable {
            message: "down".to_string(),
            retry_after: None,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_bad_gateway_body() {
        let response = AppError::BadGateway("engine exploded".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["code"], 1502);
        assert_eq!(json["message"], "engine exploded");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_cancelled_uses_client_closed_status() {
        let response = AppError::Cancelled("gone".to_string()).into_response();
        assert_eq!(response.status().as_u16(), 499);
    }

    #[test]
    fn test_retry_after_secs_rounding() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::from_millis(3001)), 4);
    }
}
