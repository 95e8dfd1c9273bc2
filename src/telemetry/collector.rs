use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::report::{EndpointTelemetry, FlushReport, LiveSnapshot, TelemetryReport};
use super::worker::TelemetryWorker;
use super::{RequestEvent, TelemetryMessage};
use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::store::TelemetryStore;

/// Handle to the telemetry pipeline.
///
/// Cheap to share behind an `Arc`. Producers call [`record`](Self::record)
/// from the request path; the query side calls
/// [`get_telemetry`](Self::get_telemetry), which first forces a flush so
/// the answer includes everything recorded before the call.
pub struct TelemetryCollector {
    tx: mpsc::Sender<TelemetryMessage>,
    store: Arc<dyn TelemetryStore>,
    dropped: Arc<AtomicU64>,
    enqueue_wait: Duration,
    query_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryCollector {
    /// Spawn the aggregation worker on the current tokio runtime.
    pub fn start(store: Arc<dyn TelemetryStore>, config: &TelemetryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = TelemetryWorker::new(rx, store.clone(), config, dropped.clone());
        let handle = tokio::spawn(worker.run());

        info!(
            backend = store.backend(),
            queue_capacity = config.queue_capacity,
            flush_interval_secs = config.flush_interval_secs,
            max_batch_events = config.max_batch_events,
            "telemetry pipeline started"
        );

        Self {
            tx,
            store,
            dropped,
            enqueue_wait: config.enqueue_wait(),
            query_timeout: config.query_timeout(),
            worker: Mutex::new(Some(handle)),
        }
    }

    // ─── Write side ──────────────────────────────────────────────

    /// Enqueue one request observation. Never blocks and never fails: when
    /// the queue is full or the pipeline is gone the event is counted as
    /// dropped and discarded.
    pub fn record(&self, endpoint: impl Into<String>, duration: Duration, success: bool) {
        let event = RequestEvent::new(endpoint, duration_ms(duration), success);
        match self.tx.try_send(TelemetryMessage::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.note_dropped("queue full"),
            Err(TrySendError::Closed(_)) => self.note_dropped("pipeline closed"),
        }
    }

    /// Like [`record`](Self::record) but waits up to `enqueue_wait` for
    /// queue space before giving up.
    pub async fn record_async(&self, endpoint: impl Into<String>, duration: Duration, success: bool) {
        let event = RequestEvent::new(endpoint, duration_ms(duration), success);
        match self
            .tx
            .send_timeout(TelemetryMessage::Event(event), self.enqueue_wait)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => self.note_dropped("enqueue wait elapsed"),
            Err(SendTimeoutError::Closed(_)) => self.note_dropped("pipeline closed"),
        }
    }

    /// Events discarded since start.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_dropped(&self, reason: &'static str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(reason, dropped_events = total, "telemetry event dropped");
    }

    // ─── Read side ───────────────────────────────────────────────

    /// Force a flush and wait for it. Resolves after every event enqueued
    /// before this call has been aggregated and persisted (or dropped after
    /// retries).
    pub async fn flush(&self) -> Result<FlushReport, TelemetryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.request(TelemetryMessage::Flush(done_tx), done_rx).await
    }

    /// Merged telemetry for `day`, including everything recorded so far.
    pub async fn get_telemetry(&self, day: NaiveDate) -> Result<TelemetryReport, TelemetryError> {
        let flush = self.flush().await?;
        debug!(%day, outcome = ?flush.outcome, "flushed before telemetry query");

        let records = self.store.obtain_by_day(day).await?;
        Ok(TelemetryReport {
            day,
            endpoints: records.into_iter().map(EndpointTelemetry::from).collect(),
        })
    }

    /// Un-flushed aggregates plus the last flush result.
    pub async fn live_snapshot(&self) -> Result<LiveSnapshot, TelemetryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(TelemetryMessage::Peek(reply_tx), reply_rx).await
    }

    /// Send a control message and await its reply, both inside the query
    /// timeout.
    async fn request<T>(
        &self,
        msg: TelemetryMessage,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, TelemetryError> {
        let exchange = async {
            self.tx
                .send(msg)
                .await
                .map_err(|_| TelemetryError::PipelineClosed)?;
            reply.await.map_err(|_| TelemetryError::PipelineClosed)
        };

        time::timeout(self.query_timeout, exchange)
            .await
            .map_err(|_| TelemetryError::FlushTimeout(self.query_timeout))?
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stop the worker after it has drained the queue and run one final
    /// flush. Safe to call more than once. If the shutdown message cannot
    /// be queued within the query timeout the worker is aborted instead.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };

        match self
            .tx
            .send_timeout(TelemetryMessage::Shutdown, self.query_timeout)
            .await
        {
            Ok(()) => {}
            // Worker already gone; the join below reports why
            Err(SendTimeoutError::Closed(_)) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "telemetry queue not draining, aborting worker without a final flush"
                );
                handle.abort();
            }
        }
        match handle.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => error!(error = %err, "telemetry worker terminated abnormally"),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
