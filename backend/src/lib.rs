pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod events;
pub mod handlers;
pub mod messaging;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod runtime;
pub mod services;
pub mod state;
pub mod types;
pub mod utils;
pub mod validation;

use axum::{
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{docs::ApiDoc, state::AppState};

/// Query and consent routes. Everything except health and the API docs
/// requires gateway tenant context.
pub fn build_router(state: AppState) -> Router {
    let scoped = Router::new()
        .route("/audit-events", get(handlers::audit_events::list_audit_events))
        .route("/audit-events/{id}", get(handlers::audit_events::get_audit_event))
        .route("/consent-records", get(handlers::consents::list_consent_records))
        .route("/consent/purposes", get(handlers::consents::list_purposes))
        .route("/consent/purposes/{code}", get(handlers::consents::get_purpose))
        .route("/consent/policies/current", get(handlers::consents::current_policy))
        .route("/consent/grant", post(handlers::consents::grant_consent))
        .route("/consent/revoke", post(handlers::consents::revoke_consent))
        .route("/consent/status", get(handlers::consents::consent_status))
        .route_layer(axum_middleware::from_fn(middleware::gateway_context));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(scoped)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(middleware::request_id))
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(middleware::log_error_responses))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                        .allow_headers(Any)
                        .max_age(std::time::Duration::from_secs(24 * 60 * 60)),
                ),
        )
        .with_state(state)
}
