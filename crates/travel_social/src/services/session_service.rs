use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::{
    models::sessions::Session, repositories::session_repository::SessionRepository,
    store::StoreError, utils::errors::app_error::AppError,
};

/// Resolves bearer tokens issued by the identity provider into sessions.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Session, AppError>;
}

/// Looks tokens up in the `sessions` collection maintained by the identity layer.
pub struct SessionService {
    session_repository: Arc<SessionRepository>,
}

impl SessionService {
    pub fn new(session_repository: Arc<SessionRepository>) -> Self {
        Self { session_repository }
    }
}

#[async_trait]
impl IdentityProvider for SessionService {
    async fn verify(&self, token: &str) -> Result<Session, AppError> {
        let session = self
            .session_repository
            .find_by_token(token)
            .await
            .map_err(|e| match e {
                StoreError::InvalidPath(_) => {
                    AppError::Unauthenticated("Malformed session token".to_string())
                }
                e => {
                    error!("Failed to look up session: {}", e);
                    AppError::from(e)
                }
            })?;

        session.ok_or_else(|| {
            debug!("Rejected unknown session token");
            AppError::Unauthenticated("Invalid or expired session".to_string())
        })
    }
}

/// Fixed token table, for tests and local tooling.
#[derive(Default)]
pub struct StaticIdentityProvider {
    sessions: HashMap<String, Session>,
}

impl StaticIdentityProvider {
    pub fn with_session(mut self, token: &str, user_id: &str, is_admin: bool) -> Self {
        self.sessions.insert(
            token.to_string(),
            Session {
                user_id: user_id.to_string(),
                is_admin,
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, token: &str) -> Result<Session, AppError> {
        self.sessions
            .get(token)
            .cloned()
            .ok_or_else(|| AppError::Unauthenticated("Invalid or expired session".to_string()))
    }
}
