use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
///
/// Static segments (`/config`, `/health`, `/api`) take precedence over
/// the `/{serial}.mp4` capture; everything else falls through to the
/// static UI service when one is configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/config", get(handlers::get_config))
        .route("/config", post(handlers::update_config))
        .route("/health", get(handlers::health))
        .route("/api", any(ws_handler))
        .route("/:filename", get(handlers::stream_mp4));

    if let Some(ref serve_dir) = state.static_files {
        router = router.fallback_service(serve_dir.clone());
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
