//! Single UUID path segment, rejected with `INVALID_UUID`.

use crate::errors::{ErrorCode, error_response};
use axum::{
    extract::{FromRequestParts, Path},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

pub struct UuidPath(pub Uuid);

impl<S> FromRequestParts<S> for UuidPath
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| e.into_response())?;

        Uuid::parse_str(&id).map(UuidPath).map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid UUID: {}", id),
                ErrorCode::InvalidUuid,
            )
        })
    }
}
