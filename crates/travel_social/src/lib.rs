use std::sync::Arc;

use apis::setup_routes;
use axum::Router;
use container::ServiceContainer;
use services::{
    follow_service::FollowService, redis_service::RedisService,
    session_service::IdentityProvider, user_service::UserService,
};
use store::{DocumentStore, MemoryStore};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub mod apis;
pub mod container;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;
pub mod store;
pub mod utils;

pub struct AppState {
    pub user_service: UserService,
    pub follow_service: FollowService,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Redis when `REDIS_URL` is configured, otherwise a process-local store.
pub async fn setup_store(
    settings: &settings::Settings,
) -> Result<Arc<dyn DocumentStore>, Box<dyn std::error::Error>> {
    match &settings.redis_url {
        Some(redis_url) => {
            let redis_service = RedisService::new(redis_url).await?;
            info!("Using redis document store");
            Ok(Arc::new(redis_service))
        }
        None => {
            if settings.is_production() {
                warn!("REDIS_URL is not set, data will not survive a restart");
            }
            info!("Using in-memory document store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn setup_router(
    settings: &settings::Settings,
) -> Result<Router, Box<dyn std::error::Error>> {
    let store = setup_store(settings).await?;
    let container = ServiceContainer::new(settings, store);
    Ok(app(container.into_app_state()))
}

pub fn app(state: AppState) -> Router {
    setup_routes()
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub fn init_tracing(settings: &settings::Settings) {
    let env = settings.environment.clone().unwrap_or("DEV".to_string());
    let level = match env.as_str() {
        "PROD" => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true)
        .with_ansi(env != "PROD")
        .init();
}
