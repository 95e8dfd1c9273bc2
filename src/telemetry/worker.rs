use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use super::aggregate::EndpointAggregate;
use super::report::{FlushOutcome, FlushReport, FlushTrigger, LiveSnapshot};
use super::retry::RetryPolicy;
use super::{RequestEvent, TelemetryMessage};
use crate::config::TelemetryConfig;
use crate::error::StoreError;
use crate::store::{DailyTelemetryRecord, TelemetryStore};

/// What the loop should do after handling one message.
enum Step {
    Continue,
    /// A flush ran off-schedule; the interval timer restarts from now.
    Flushed,
    Stop,
}

/// The single consumer of the ingestion channel.
///
/// Owns the per-endpoint aggregates outright, so nothing here is shared or
/// locked. Aggregation, flushing and snapshotting are serialized by the
/// channel order.
pub(crate) struct TelemetryWorker {
    rx: mpsc::Receiver<TelemetryMessage>,
    store: Arc<dyn TelemetryStore>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    flush_interval: Duration,
    max_batch_events: u64,
    dropped: Arc<AtomicU64>,

    aggregates: HashMap<String, EndpointAggregate>,
    events_since_flush: u64,
    last_flush: Option<FlushReport>,
}

impl TelemetryWorker {
    pub(crate) fn new(
        rx: mpsc::Receiver<TelemetryMessage>,
        store: Arc<dyn TelemetryStore>,
        config: &TelemetryConfig,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            rx,
            store,
            retry: config.retry.policy(),
            attempt_timeout: config.retry.attempt_timeout(),
            flush_interval: config.flush_interval(),
            max_batch_events: config.max_batch_events.max(1) as u64,
            dropped,
            aggregates: HashMap::new(),
            events_since_flush: 0,
            last_flush: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let period = self.flush_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            backend = self.store.backend(),
            flush_interval_ms = period.as_millis() as u64,
            max_batch_events = self.max_batch_events,
            "telemetry worker running"
        );

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    // Every sender is gone
                    let Some(msg) = msg else { break };
                    match self.handle(msg).await {
                        Step::Continue => {}
                        Step::Flushed => ticker.reset(),
                        Step::Stop => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush(FlushTrigger::Interval).await;
                }
            }
        }

        // ── drain ──
        // Anything already queued still counts; late Flush/Peek callers get
        // answered instead of seeing a dropped oneshot.
        self.rx.close();
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
        }

        let report = self.flush(FlushTrigger::Shutdown).await;
        info!(
            outcome = ?report.outcome,
            events = report.events,
            dropped_events = self.dropped.load(Ordering::Relaxed),
            "telemetry worker stopped"
        );
    }

    async fn handle(&mut self, msg: TelemetryMessage) -> Step {
        match msg {
            TelemetryMessage::Event(event) => {
                self.aggregate(event);
                if self.events_since_flush >= self.max_batch_events {
                    self.flush(FlushTrigger::BatchCeiling).await;
                    return Step::Flushed;
                }
                Step::Continue
            }
            TelemetryMessage::Flush(done) => {
                let report = self.flush(FlushTrigger::Requested).await;
                // Caller may have timed out already
                let _ = done.send(report);
                Step::Flushed
            }
            TelemetryMessage::Peek(reply) => {
                let _ = reply.send(self.snapshot());
                Step::Continue
            }
            TelemetryMessage::Shutdown => Step::Stop,
        }
    }

    fn aggregate(&mut self, event: RequestEvent) {
        self.aggregates
            .entry(event.endpoint.clone())
            .or_default()
            .observe(&event);
        self.events_since_flush += 1;
    }

    /// Swap the aggregates for an empty map and persist what was taken.
    /// Events arriving while this runs wait in the channel and land in the
    /// fresh map, so nothing is counted twice or lost.
    async fn flush(&mut self, trigger: FlushTrigger) -> FlushReport {
        let taken = std::mem::take(&mut self.aggregates);
        self.events_since_flush = 0;

        if taken.is_empty() {
            trace!(?trigger, "nothing to flush");
            return FlushReport::skipped(trigger);
        }

        let report = self.persist(trigger, &taken).await;
        self.last_flush = Some(report.clone());
        report
    }

    async fn persist(
        &self,
        trigger: FlushTrigger,
        taken: &HashMap<String, EndpointAggregate>,
    ) -> FlushReport {
        let day = Local::now().date_naive();
        let now = Utc::now();
        let records: Vec<DailyTelemetryRecord> = taken
            .iter()
            .map(|(endpoint, agg)| agg.to_record(endpoint, day, now))
            .collect();
        let events: u64 = records.iter().map(|r| r.request_count).sum();

        let store = self.store.as_ref();
        let batch = records.as_slice();
        let limit = self.attempt_timeout;
        // A hung call counts as a failed attempt, so retries stay bounded
        let attempt = |_: usize| async move {
            time::timeout(limit, store.merge_batch(batch))
                .await
                .unwrap_or_else(|_| Err(StoreError::Timeout(limit)))
        };
        let outcome = match self.retry.retry_async(attempt).await {
            Ok(((), attempts)) => {
                debug!(?trigger, %day, endpoints = records.len(), events, attempts, "telemetry flushed");
                FlushOutcome::Persisted { attempts }
            }
            Err((err, attempts)) => {
                error!(
                    ?trigger,
                    %day,
                    endpoints = records.len(),
                    events,
                    attempts,
                    error = %err,
                    "telemetry batch dropped after retries"
                );
                FlushOutcome::Dropped { attempts }
            }
        };

        FlushReport {
            trigger,
            endpoints: records.len(),
            events,
            outcome,
            finished_at: Utc::now(),
        }
    }

    fn snapshot(&self) -> LiveSnapshot {
        let mut endpoints: Vec<_> = self
            .aggregates
            .iter()
            .map(|(name, agg)| agg.live_view(name))
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));

        LiveSnapshot {
            taken_at: Utc::now(),
            pending_events: self.events_since_flush,
            dropped_events: self.dropped.load(Ordering::Relaxed),
            endpoints,
            last_flush: self.last_flush.clone(),
        }
    }
}
