use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    models::user_follows::RecountResponse,
    utils::errors::{app_error::AppError, error_payload::ErrorPayload},
    AppState,
};

use super::middlewares::security::MaybeSession;

pub const TAG: &str = "admin";

/// Recount a user's followers
///
/// Rewrites the stored `followers` counter from the follower markers when the
/// two disagree.
#[utoipa::path(
    post,
    tag = TAG,
    path = "/{id}/recount",
    operation_id = "recountFollowers",
    responses(
        (status = 200, description = "Stored and counted values", body = RecountResponse),
        (status = 401, description = "Not signed in", body = ErrorPayload),
        (status = 403, description = "Admin access required", body = ErrorPayload),
        (status = 404, description = "User not found", body = ErrorPayload),
        (status = 409, description = "Too much contention, try again", body = ErrorPayload)
    ),
    params(
        ("id" = String, Path, description = "User ID")
    ),
    security(("bearer" = []))
)]
pub(super) async fn recount_followers(
    State(app_state): State<Arc<AppState>>,
    MaybeSession(session): MaybeSession,
    Path(id): Path<String>,
) -> Result<Json<RecountResponse>, AppError> {
    let recount = app_state
        .follow_service
        .recount_followers(session.as_ref(), &id)
        .await?;
    Ok(Json(recount))
}
