use std::sync::Arc;

use axum::Router;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_scalar::{Scalar, Servable};

use crate::AppState;

pub mod admin_handlers;
pub mod middlewares;
pub mod user_handlers;

#[derive(OpenApi)]
#[openapi(
    modifiers(&BearerAuth),
    tags(
        (name = "users", description = "Profiles and follow relationships"),
        (name = "admin", description = "Maintenance operations")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

pub fn setup_routes() -> Router<Arc<AppState>> {
    let api_doc = ApiDoc::openapi();

    let user_router = OpenApiRouter::new()
        .routes(routes!(user_handlers::ensure_profile))
        .routes(routes!(user_handlers::get_user))
        .routes(routes!(
            user_handlers::toggle_follow,
            user_handlers::get_follow_status
        ))
        .routes(routes!(user_handlers::stream_follow_status))
        .routes(routes!(user_handlers::get_followers));

    let admin_router =
        OpenApiRouter::new().routes(routes!(admin_handlers::recount_followers));

    let user_router = OpenApiRouter::with_openapi(api_doc.clone()).nest("/users", user_router);
    let admin_router =
        OpenApiRouter::with_openapi(api_doc).nest("/admin/users", admin_router);

    let router = OpenApiRouter::new().merge(user_router).merge(admin_router);

    let (api_router, api_openapi) = OpenApiRouter::new()
        .nest("/api/v1", router)
        .split_for_parts();

    Router::new()
        .merge(Scalar::with_url("/docs", api_openapi))
        .merge(api_router)
}
