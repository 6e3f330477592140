//! HTTP control surface: `/sandboxes` (API-key protected) and the
//! unauthenticated `/health` probe.

mod auth;
mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Settings;
use crate::docker::ContainerRuntime;
use crate::lifecycle::LifecycleManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub driver: Arc<dyn ContainerRuntime>,
    pub settings: Arc<Settings>,
    pub started_at: Instant,
}

/// Build the HTTP router with all routes.
pub fn build_router(state: AppState) -> Router {
    let sandbox_routes = Router::new()
        .route("/", post(handlers::sandboxes::create_sandbox))
        .route("/", get(handlers::sandboxes::list_sandboxes))
        .route("/:sandbox_id", get(handlers::sandboxes::get_sandbox))
        .route("/:sandbox_id", delete(handlers::sandboxes::destroy_sandbox))
        .route("/:sandbox_id/exec", post(handlers::sandboxes::exec_sandbox))
        .route("/:sandbox_id/access", post(handlers::sandboxes::generate_access))
        .route("/:sandbox_id/heartbeat", post(handlers::sandboxes::heartbeat))
        .route("/:sandbox_id/complete", post(handlers::sandboxes::complete_sandbox))
        .route("/:sandbox_id/error", post(handlers::sandboxes::error_callback))
        .route("/:sandbox_id/logs", get(handlers::sandboxes::get_logs))
        .route("/:sandbox_id/stats", get(handlers::sandboxes::get_stats))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .nest("/sandboxes", sandbox_routes)
        .route("/health", get(handlers::health::health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
