use crate::store::{CollectionPath, DocumentPath, StoreError};

/// Document layout of the follow relationship data.
pub struct DocumentPaths;

impl DocumentPaths {
    pub const USERS: &'static str = "users";
    pub const FOLLOWERS: &'static str = "followers";
    pub const SESSIONS: &'static str = "sessions";

    /// `users/{userId}`
    pub fn user(user_id: &str) -> Result<DocumentPath, StoreError> {
        CollectionPath::parse(Self::USERS)?.doc(user_id)
    }

    /// `users/{targetUserId}/followers`
    pub fn followers(target_user_id: &str) -> Result<CollectionPath, StoreError> {
        Self::user(target_user_id)?.collection(Self::FOLLOWERS)
    }

    /// `users/{targetUserId}/followers/{followerUserId}`
    pub fn follower(
        target_user_id: &str,
        follower_user_id: &str,
    ) -> Result<DocumentPath, StoreError> {
        Self::followers(target_user_id)?.doc(follower_user_id)
    }

    /// `sessions/{token}`
    pub fn session(token: &str) -> Result<DocumentPath, StoreError> {
        CollectionPath::parse(Self::SESSIONS)?.doc(token)
    }
}
