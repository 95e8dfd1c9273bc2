use axum::{middleware as axum_mw, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::telemetry;
use crate::middleware::timing;
use crate::AppState;

/// Builds the telemetry `Router`. A host service merges its own routes in
/// with [`with_telemetry`] so they are timed and recorded too.
pub fn create_router(state: Arc<AppState>) -> Router {
    with_telemetry(Router::new(), state)
}

/// Adds the telemetry routes to `routes` and wraps everything in the
/// recording middleware.
pub fn with_telemetry(routes: Router<Arc<AppState>>, state: Arc<AppState>) -> Router {
    routes
        // ── Telemetry ───────────────────────────────────────────
        .route("/telemetria", get(telemetry::get_telemetry))
        .route("/telemetria/live", get(telemetry::live_snapshot))
        .route("/telemetria/live/stream", get(telemetry::live_stream))
        .route("/health", get(telemetry::health))
        // ── Global middleware (applied bottom-up) ───────────────
        // route_layer would skip unmatched requests; layer sees them too
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            timing::telemetry_middleware,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
