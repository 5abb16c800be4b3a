//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use cytoseg_core::types::DbId;

use crate::error::AppError;

/// Header carrying the caller identity resolved by the platform gateway.
pub const OWNER_ID_HEADER: &str = "x-owner-id";

/// The authenticated owner on whose behalf a request runs.
///
/// Authentication itself happens at the platform gateway, which forwards the
/// resolved user id in the `X-Owner-Id` header; this service trusts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerId(pub DbId);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(OWNER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("Missing X-Owner-Id header".to_string()))?;
        let value = header
            .to_str()
            .map_err(|_| AppError::Unauthorized("Invalid X-Owner-Id header".to_string()))?;
        let owner_id: DbId = value
            .parse()
            .map_err(|_| AppError::Unauthorized("Invalid X-Owner-Id header".to_string()))?;
        Ok(OwnerId(owner_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
