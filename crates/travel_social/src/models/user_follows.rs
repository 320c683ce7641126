use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Field stamped by the store when a marker is created.
pub const FOLLOWED_AT_FIELD: &str = "followedAt";

/// Stored form of `users/{target}/followers/{follower}`. Its existence is the
/// relationship; the timestamp is informational.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowMarker {
    pub followed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowState {
    NotFollowing,
    Following,
}

impl FollowState {
    pub fn from_marker_exists(exists: bool) -> Self {
        if exists {
            FollowState::Following
        } else {
            FollowState::NotFollowing
        }
    }

    pub fn is_following(self) -> bool {
        self == FollowState::Following
    }

    /// The state a toggle moves to.
    pub fn toggled(self) -> Self {
        match self {
            FollowState::NotFollowing => FollowState::Following,
            FollowState::Following => FollowState::NotFollowing,
        }
    }
}

/// Result of the existence check. `is_loading` distinguishes "not resolved yet"
/// from a confirmed `is_following == false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FollowStatus {
    pub is_following: bool,
    pub is_loading: bool,
}

impl FollowStatus {
    pub const LOADING: FollowStatus = FollowStatus {
        is_following: false,
        is_loading: true,
    };

    pub fn resolved(is_following: bool) -> Self {
        FollowStatus {
            is_following,
            is_loading: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FollowToggleResponse {
    pub following: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FollowerResponse {
    pub follower_id: String,
    pub followed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecountResponse {
    pub user_id: String,
    pub previous: u64,
    pub counted: u64,
}
