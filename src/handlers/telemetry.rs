use axum::{
    extract::{rejection::QueryRejection, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::AppError;
use crate::telemetry::{LiveSnapshot, TelemetryReport};
use crate::AppState;

const LIVE_PUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    /// `YYYY-MM-DD`; today (local) when omitted.
    pub day: Option<NaiveDate>,
}

// ─── GET /telemetria ─────────────────────────────────────────────
/// Merged daily telemetry. Flushes pending events first, so requests
/// answered before this one are included.

pub async fn get_telemetry(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TelemetryQuery>, QueryRejection>,
) -> Result<Json<TelemetryReport>, AppError> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let day = query.day.unwrap_or_else(|| Local::now().date_naive());

    let report = state.telemetry.get_telemetry(day).await?;
    Ok(Json(report))
}

// ─── GET /telemetria/live ────────────────────────────────────────

pub async fn live_snapshot(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LiveSnapshot>, AppError> {
    Ok(Json(state.telemetry.live_snapshot().await?))
}

// ─── GET /telemetria/live/stream ─────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes a `LiveSnapshot` as JSON every second. A ticker task feeds the
/// stream and exits when the client disconnects.

pub async fn live_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIVE_PUSH_INTERVAL);
        loop {
            ticker.tick().await;
            let event = match state.telemetry.live_snapshot().await {
                Ok(snapshot) => snapshot_event(&snapshot),
                Err(err) => error_event(&err),
            };
            if tx.send(Ok(event)).await.is_err() {
                debug!("live stream client disconnected");
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// `snapshot` event carrying the JSON body, or an `error` event when the
/// body cannot be serialized.
fn snapshot_event<T: Serialize>(snapshot: &T) -> Event {
    match serde_json::to_string(snapshot) {
        Ok(json) => Event::default().event("snapshot").data(json),
        Err(err) => {
            warn!(error = %err, "live snapshot not serializable");
            error_event(&err)
        }
    }
}

fn error_event(err: &dyn std::fmt::Display) -> Event {
    Event::default().event("error").data(err.to_string())
}

// ─── GET /health ─────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = if state.telemetry.is_running() { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status":  status,
        "storage": state.telemetry.backend(),
    }))
}
