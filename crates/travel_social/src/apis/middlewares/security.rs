use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{models::sessions::Session, utils::errors::app_error::AppError, AppState};

/// Session of the caller when an `Authorization: Bearer` header is present.
///
/// A header carrying an unknown token is rejected rather than treated as
/// anonymous.
pub struct MaybeSession(pub Option<Session>);

/// Session of the caller; rejects anonymous requests with `401`.
pub struct RequireSession(pub Session);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for MaybeSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Ok(TypedHeader(Authorization(bearer))) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await
        else {
            return Ok(MaybeSession(None));
        };

        let session = state.identity.verify(bearer.token()).await?;
        Ok(MaybeSession(Some(session)))
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        match MaybeSession::from_request_parts(parts, state).await? {
            MaybeSession(Some(session)) => Ok(RequireSession(session)),
            MaybeSession(None) => Err(AppError::Unauthenticated(
                "Missing bearer token".to_string(),
            )),
        }
    }
}
