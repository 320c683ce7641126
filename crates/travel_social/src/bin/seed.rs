//! Seeds user profiles and session tokens into the configured redis store.
//!
//! `seed alice bob admin:root` creates three profiles; ids prefixed with
//! `admin:` get an admin session. Prints one bearer token per user.

use std::sync::Arc;

use dotenv::dotenv;
use tracing::{error, info};
use travel_social::{
    models::{sessions::Session, users::NewUser},
    repositories::{session_repository::SessionRepository, user_repository::UserRepository},
    services::user_service::UserService,
    settings,
};
use uuid::Uuid;

const DEFAULT_USERS: [&str; 3] = ["alice", "bob", "admin:root"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let settings = settings::load_settings()?;
    travel_social::init_tracing(&settings);

    if settings.redis_url.is_none() {
        error!("REDIS_URL must be set, the in-memory store does not outlive this process");
        return Ok(());
    }
    let store = travel_social::setup_store(&settings).await?;
    let user_service = UserService::new(
        Arc::new(UserRepository::new(store.clone())),
        settings.retry_policy(),
    );
    let sessions = SessionRepository::new(store);

    let mut users: Vec<String> = std::env::args().skip(1).collect();
    if users.is_empty() {
        users = DEFAULT_USERS.iter().map(|u| u.to_string()).collect();
    }

    for user in users {
        let (user_id, is_admin) = match user.strip_prefix("admin:") {
            Some(id) => (id.to_string(), true),
            None => (user, false),
        };
        let profile = user_service
            .ensure_profile(
                &user_id,
                NewUser {
                    name: Some(user_id.clone()),
                    ..NewUser::default()
                },
            )
            .await?;

        let token = Uuid::new_v4().to_string();
        sessions
            .save(&token, &Session { user_id, is_admin })
            .await?;
        info!(
            "{} (followers {}, following {}) token {}",
            profile.id, profile.followers, profile.following, token
        );
    }

    Ok(())
}
