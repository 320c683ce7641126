use std::sync::Arc;

use crate::{
    repositories::{session_repository::SessionRepository, user_repository::UserRepository},
    services::{
        follow_service::FollowService,
        session_service::{IdentityProvider, SessionService},
        user_service::UserService,
    },
    settings::Settings,
    store::DocumentStore,
    AppState,
};

pub struct ServiceContainer {
    pub user_service: UserService,
    pub follow_service: FollowService,
    pub identity: Arc<dyn IdentityProvider>,
}

impl ServiceContainer {
    pub fn new(settings: &Settings, store: Arc<dyn DocumentStore>) -> Self {
        let user_repository = Arc::new(UserRepository::new(store.clone()));
        let session_repository = Arc::new(SessionRepository::new(store));
        let retry_policy = settings.retry_policy();

        let user_service = UserService::new(user_repository.clone(), retry_policy.clone());
        let follow_service = FollowService::new(
            user_repository,
            retry_policy,
            settings.follow_status_timeout(),
        );
        let identity = Arc::new(SessionService::new(session_repository));

        Self {
            user_service,
            follow_service,
            identity,
        }
    }

    pub fn into_app_state(self) -> AppState {
        AppState {
            user_service: self.user_service,
            follow_service: self.follow_service,
            identity: self.identity,
        }
    }
}
