pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Ingestion + query facade over the telemetry pipeline.
    pub telemetry: Arc<telemetry::TelemetryCollector>,

    /// Effective configuration, read by the recording middleware.
    pub config: Arc<config::AppConfig>,
}
