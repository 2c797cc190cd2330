//! Caller identity.
//!
//! Authentication happens in front of this service; the fronting layer
//! forwards the authenticated user id in `x-user-id`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub i64);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(CurrentUser)
            .ok_or(ApiError::Unauthenticated)
    }
}
