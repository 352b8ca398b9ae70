//! Error codes shared by every JSON error body.
//!
//! Each code has a SCREAMING_SNAKE_CASE identifier for clients, an integer
//! for logs and dashboards, and a default message.
//!
//! ```rust
//! use axum_helpers::errors::ErrorCode;
//!
//! let code = ErrorCode::RateLimited;
//! assert_eq!(code.as_str(), "RATE_LIMITED");
//! assert_eq!(code.code(), 1009);
//! ```

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Client errors (1000-1999)
    ValidationError,
    InvalidUuid,
    InvalidJson,
    NotFound,
    /// Credential missing, malformed, unknown or revoked
    Unauthorized,
    /// Credential valid but lacks the permission or scope
    Forbidden,
    Conflict,
    JsonExtraction,
    RateLimited,
    /// Caller went away before the request completed
    Cancelled,

    // Server errors (1500-1999)
    InternalError,
    /// Admission cap reached or metadata store unavailable
    ServiceUnavailable,
    /// Downstream storage engine reported a failure
    UpstreamFailure,

    // Persistence errors (2000-2999)
    DatabaseError,
    DatabasePoolTimeout,

    // Serialization errors (5000s)
    SerdeJsonError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidUuid => "INVALID_UUID",
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::JsonExtraction => "JSON_EXTRACTION",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::UpstreamFailure => "UPSTREAM_FAILURE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::DatabasePoolTimeout => "DATABASE_POOL_TIMEOUT",
            ErrorCode::SerdeJsonError => "SERDE_JSON_ERROR",
        }
    }

    pub const fn code(&self) -> i32 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidUuid => 1002,
            ErrorCode::InvalidJson => 1003,
            ErrorCode::NotFound => 1004,
            ErrorCode::Unauthorized => 1005,
            ErrorCode::Forbidden => 1006,
            ErrorCode::Conflict => 1007,
            ErrorCode::JsonExtraction => 1008,
            ErrorCode::RateLimited => 1009,
            ErrorCode::Cancelled => 1010,
            ErrorCode::InternalError => 1500,
            ErrorCode::ServiceUnavailable => 1501,
            ErrorCode::UpstreamFailure => 1502,
            ErrorCode::DatabaseError => 2001,
            ErrorCode::DatabasePoolTimeout => 2002,
            ErrorCode::SerdeJsonError => 5001,
        }
    }

    pub const fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "Request validation failed",
            ErrorCode::InvalidUuid => "Invalid UUID format",
            ErrorCode::InvalidJson => "Invalid JSON format",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::Forbidden => "Insufficient permissions",
            ErrorCode::Conflict => "Resource conflict",
            ErrorCode::JsonExtraction => "Failed to extract JSON from request body",
            ErrorCode::RateLimited => "Rate limit exceeded",
            ErrorCode::Cancelled => "Request cancelled",
            ErrorCode::InternalError => "An internal server error occurred",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::UpstreamFailure => "Upstream service failed",
            ErrorCode::DatabaseError => "A database error occurred",
            ErrorCode::DatabasePoolTimeout => "Database connection pool timed out",
            ErrorCode::SerdeJsonError => "JSON processing error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_matches_as_str() {
        for code in [
            ErrorCode::RateLimited,
            ErrorCode::ServiceUnavailable,
            ErrorCode::UpstreamFailure,
            ErrorCode::Cancelled,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_codes_are_unique() {
        let all = [
            ErrorCode::ValidationError,
            ErrorCode::InvalidUuid,
            ErrorCode::InvalidJson,
            ErrorCode::NotFound,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::Conflict,
            ErrorCode::JsonExtraction,
            ErrorCode::RateLimited,
            ErrorCode::Cancelled,
            ErrorCode::InternalError,
            ErrorCode::ServiceUnavailable,
            ErrorCode::UpstreamFailure,
            ErrorCode::DatabaseError,
            ErrorCode::DatabasePoolTimeout,
            ErrorCode::SerdeJsonError,
        ];
        let unique: std::collections::HashSet<_> = all.iter().map(|c| c.code()).collect();
        assert_eq!(unique.len(), all.len());
    }
}
