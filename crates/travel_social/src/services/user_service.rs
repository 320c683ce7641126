use crate::models::user_follows::FollowerResponse;
use crate::models::users::{NewUser, UserResponse};
use crate::repositories::user_repository::UserRepository;
use crate::store::RetryPolicy;
use crate::utils::errors::app_error::AppError;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct UserService {
    user_repository: Arc<UserRepository>,
    retry_policy: RetryPolicy,
}

impl UserService {
    pub fn new(user_repository: Arc<UserRepository>, retry_policy: RetryPolicy) -> Self {
        Self {
            user_repository,
            retry_policy,
        }
    }

    pub async fn get_user(&self, id: &str) -> Result<UserResponse, AppError> {
        let user = self
            .user_repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", id)))?;
        Ok(UserResponse::from(user))
    }

    /// Creates the profile of a user signing in for the first time. An existing
    /// profile is returned unchanged.
    pub async fn ensure_profile(&self, id: &str, user: NewUser) -> Result<UserResponse, AppError> {
        let existed = self.user_repository.find_by_id(id).await?.is_some();
        let account = self
            .user_repository
            .create_if_absent(id, user, &self.retry_policy)
            .await?;
        if !existed {
            info!("Created profile for user {}", id);
        }
        Ok(UserResponse::from(account))
    }

    pub async fn get_followers(&self, id: &str) -> Result<Vec<FollowerResponse>, AppError> {
        if self.user_repository.find_by_id(id).await?.is_none() {
            return Err(AppError::NotFound(format!("User {}", id)));
        }
        let followers = self.user_repository.list_followers(id).await?;
        Ok(followers
            .into_iter()
            .map(|(follower_id, marker)| FollowerResponse {
                follower_id,
                followed_at: marker.followed_at,
            })
            .collect())
    }
}
