use axum::{http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub const DEFAULT_DISPLAY_NAME: &str = "New User";

/// Stored form of `users/{id}`. Fields this service does not know about are
/// left untouched because every write to a user is a partial update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub following: u64,
}

impl UserAccount {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or(DEFAULT_DISPLAY_NAME)
    }
}

/// The two counters of `users/{id}`, read without the rest of the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
pub struct FollowCounters {
    #[serde(default, deserialize_with = "lenient_counter")]
    pub followers: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub following: u64,
}

/// A counter that is negative, fractional or not a number reads as 0.
fn lenient_counter<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_u64()
        .or_else(|| value.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64))
        .unwrap_or(0))
}

/// Profile written on first sign-in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

impl NewUser {
    pub fn into_account(self, id: &str) -> UserAccount {
        UserAccount {
            id: id.to_string(),
            name: Some(self.name.unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string())),
            username: None,
            email: self.email,
            avatar_url: self.avatar_url,
            followers: 0,
            following: 0,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: String,
    pub name: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub followers: u64,
    pub following: u64,
}

impl From<UserAccount> for UserResponse {
    fn from(user: UserAccount) -> Self {
        UserResponse {
            name: user.display_name().to_string(),
            id: user.id,
            username: user.username,
            avatar_url: user.avatar_url,
            followers: user.followers,
            following: user.following,
        }
    }
}

impl IntoResponse for UserResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::OK, axum::Json(self)).into_response()
    }
}
