use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::AppState;

/// Records every completed request into the telemetry pipeline and adds
/// two response headers:
///
///   X-Response-Time-Ms  total handler wall time in milliseconds
///   Server-Timing       same value in the standard Server-Timing format
///
/// The endpoint name is `"{METHOD} {route}"`, using the matched route
/// template (`/simulacoes/:id`) so ids don't explode the key space.
/// Unmatched requests fall back to the raw path.
pub async fn telemetry_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if state.config.telemetry.is_excluded(&path) {
        return next.run(req).await;
    }

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned())
        .unwrap_or(path);
    let endpoint = format!("{} {}", req.method(), route);

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();

    // ── Inject response headers ─────────────────────────────────
    if let Ok(val) = elapsed.as_millis().to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Ms", val);
    }
    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    let status = response.status();
    debug!(
        endpoint = %endpoint,
        status = status.as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "request observed"
    );

    state
        .telemetry
        .record(endpoint, elapsed, status.is_success());

    response
}
