use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::{stream, Stream};
use tracing::warn;

use crate::{
    models::{
        user_follows::{FollowStatus, FollowToggleResponse, FollowerResponse},
        users::{NewUser, UserResponse},
    },
    utils::errors::{app_error::AppError, error_payload::ErrorPayload},
    AppState,
};

use super::middlewares::security::{MaybeSession, RequireSession};

pub const TAG: &str = "users";

/// Follow or unfollow a user
///
/// Flips the relationship between the caller and the user in the path.
#[utoipa::path(
    post,
    tag = TAG,
    path = "/{id}/follow",
    operation_id = "toggleFollow",
    responses(
        (status = 200, description = "Relationship toggled", body = FollowToggleResponse),
        (status = 400, description = "Cannot follow yourself", body = ErrorPayload),
        (status = 401, description = "Not signed in", body = ErrorPayload),
        (status = 404, description = "User not found", body = ErrorPayload),
        (status = 409, description = "Too much contention, try again", body = ErrorPayload),
        (status = 503, description = "Store unavailable", body = ErrorPayload)
    ),
    params(
        ("id" = String, Path, description = "User ID to follow or unfollow")
    ),
    security(("bearer" = []))
)]
pub(super) async fn toggle_follow(
    State(app_state): State<Arc<AppState>>,
    MaybeSession(session): MaybeSession,
    Path(target_user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let following = app_state
        .follow_service
        .toggle_follow(session.as_ref(), &target_user_id)
        .await?;
    Ok((StatusCode::OK, Json(FollowToggleResponse { following })))
}

/// Check whether the caller follows a user
#[utoipa::path(
    get,
    tag = TAG,
    path = "/{id}/follow",
    operation_id = "getFollowStatus",
    responses(
        (status = 200, description = "Follow status; loading while it cannot be resolved", body = FollowStatus),
        (status = 503, description = "Store unavailable", body = ErrorPayload)
    ),
    params(
        ("id" = String, Path, description = "User ID being viewed")
    )
)]
pub(super) async fn get_follow_status(
    State(app_state): State<Arc<AppState>>,
    MaybeSession(session): MaybeSession,
    Path(target_user_id): Path<String>,
) -> Result<Json<FollowStatus>, AppError> {
    let status = app_state
        .follow_service
        .follow_status(
            Some(&target_user_id),
            session.as_ref().map(|s| s.user_id.as_str()),
        )
        .await?;
    Ok(Json(status))
}

/// Stream the follow status as server-sent events
///
/// Emits the current status first, then every change.
#[utoipa::path(
    get,
    tag = TAG,
    path = "/{id}/follow/events",
    operation_id = "streamFollowStatus",
    responses(
        (status = 200, description = "`follow-status` events", content_type = "text/event-stream", body = FollowStatus),
        (status = 503, description = "Store unavailable", body = ErrorPayload)
    ),
    params(
        ("id" = String, Path, description = "User ID being viewed")
    )
)]
pub(super) async fn stream_follow_status(
    State(app_state): State<Arc<AppState>>,
    MaybeSession(session): MaybeSession,
    Path(target_user_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let receiver = app_state
        .follow_service
        .watch_follow_status(
            Some(&target_user_id),
            session.as_ref().map(|s| s.user_id.as_str()),
        )
        .await?;

    let events = stream::unfold((receiver, true), |(mut receiver, first)| async move {
        if !first && receiver.changed().await.is_err() {
            return None;
        }
        let status = *receiver.borrow_and_update();
        Some((Ok(status_event(status)), (receiver, false)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn status_event(status: FollowStatus) -> Event {
    let event = Event::default().event("follow-status");
    match serde_json::to_string(&status) {
        Ok(data) => event.data(data),
        Err(e) => {
            warn!("Failed to encode follow status: {}", e);
            event.data("{}")
        }
    }
}

/// Get a user's profile
#[utoipa::path(
    get,
    tag = TAG,
    path = "/{id}",
    operation_id = "getUser",
    responses(
        (status = 200, description = "User profile with counters", body = UserResponse),
        (status = 404, description = "User not found", body = ErrorPayload),
        (status = 503, description = "Store unavailable", body = ErrorPayload)
    ),
    params(
        ("id" = String, Path, description = "User ID")
    )
)]
pub(super) async fn get_user(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<UserResponse, AppError> {
    app_state.user_service.get_user(&id).await
}

/// List the followers of a user, newest first
#[utoipa::path(
    get,
    tag = TAG,
    path = "/{id}/followers",
    operation_id = "getFollowers",
    responses(
        (status = 200, description = "Followers of the user", body = Vec<FollowerResponse>),
        (status = 404, description = "User not found", body = ErrorPayload),
        (status = 503, description = "Store unavailable", body = ErrorPayload)
    ),
    params(
        ("id" = String, Path, description = "User ID")
    )
)]
pub(super) async fn get_followers(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let followers = app_state.user_service.get_followers(&id).await?;
    Ok((StatusCode::OK, Json(followers)))
}

/// Create the caller's profile on first sign-in
#[utoipa::path(
    post,
    tag = TAG,
    path = "/me",
    operation_id = "ensureProfile",
    responses(
        (status = 200, description = "The caller's profile", body = UserResponse),
        (status = 401, description = "Not signed in", body = ErrorPayload),
        (status = 503, description = "Store unavailable", body = ErrorPayload)
    ),
    request_body = NewUser,
    security(("bearer" = []))
)]
pub(super) async fn ensure_profile(
    State(app_state): State<Arc<AppState>>,
    RequireSession(session): RequireSession,
    Json(body): Json<NewUser>,
) -> Result<UserResponse, AppError> {
    app_state
        .user_service
        .ensure_profile(&session.user_id, body)
        .await
}
