pub mod aggregate;
pub mod collector;
pub mod report;
pub mod retry;
mod worker;

pub use aggregate::EndpointAggregate;
pub use collector::TelemetryCollector;
pub use report::{
    EndpointTelemetry, FlushOutcome, FlushReport, FlushTrigger, LatencySummary, LiveEndpoint,
    LiveSnapshot, TelemetryReport,
};
pub use retry::RetryPolicy;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// A single completed request, as seen by the timing middleware.
/// This is the "write" side: producers create these and push them in.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEvent {
    /// e.g. "GET /simulacoes"
    pub endpoint: String,
    pub duration_ms: u64,
    /// true for a 2xx response
    pub success: bool,
    pub observed_at: DateTime<Utc>,
}

impl RequestEvent {
    pub fn new(endpoint: impl Into<String>, duration_ms: u64, success: bool) -> Self {
        Self {
            endpoint: endpoint.into(),
            duration_ms,
            success,
            observed_at: Utc::now(),
        }
    }
}

/// Everything that travels on the ingestion channel. Control messages
/// share the queue with events so they observe the same FIFO order.
#[derive(Debug)]
pub(crate) enum TelemetryMessage {
    Event(RequestEvent),
    /// Resolved once every earlier event is aggregated and persisted (or dropped).
    Flush(oneshot::Sender<FlushReport>),
    Peek(oneshot::Sender<LiveSnapshot>),
    Shutdown,
}
