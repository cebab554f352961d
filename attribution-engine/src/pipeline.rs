use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use health::HealthRegistry;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::attribution::{AttributionCalculator, AttributionModel};
use crate::audit::{ExpiredJourney, ExpiredJourneyLog};
use crate::dead_letter::{DeadLetterReason, DeadLetterSink};
use crate::dedup::Deduplicator;
use crate::error::PipelineError;
use crate::event::{EventNormalizer, RawEvent};
use crate::journey::{JourneyAssembler, OpenJourneyBudget};
use crate::metrics_consts::{
    BACKPRESSURE_COUNTER, EVENTS_REJECTED_COUNTER, INGEST_BATCH_SIZE_HISTOGRAM,
    INGEST_OUTCOMES_COUNTER,
};
use crate::partition::{PartitionCommand, PartitionRouter, PartitionState, PartitionWorker};
use crate::retry::RetryPolicy;
use crate::sink::{
    AttributionSink, BatchConfig, BatchingPublisher, PublisherCommand, SinkPublisher,
};
use crate::time::{to_time_duration, Clock};

/// Per-event answer at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Taken in, or recognised as a duplicate of something already taken in
    Accepted,
    /// Permanently refused; redelivery will not help
    Rejected(String),
    /// Not taken in; the caller should retry later
    Backpressure,
}

impl IngestOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted => "accepted",
            IngestOutcome::Rejected(_) => "rejected",
            IngestOutcome::Backpressure => "backpressure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub partitions: usize,
    pub partition_buffer_size: usize,
    pub out_of_order_tolerance: Duration,
    pub journey_window: Duration,
    pub dedup_retention: Duration,
    pub dedup_bucket: Duration,
    pub time_decay_half_life: Duration,
    pub max_open_journeys: usize,
    pub max_future_skew: Duration,
    pub batch_max_size: usize,
    pub batch_max_age: Duration,
    pub max_batch_events: usize,
    pub requested_models: Vec<AttributionModel>,
    pub sweep_interval: Duration,
    pub drain_timeout: Duration,
    pub sink_retry_initial: Duration,
    pub sink_retry_max: Duration,
    pub sink_max_attempts: Option<u32>,
    pub sink_max_in_flight: usize,
    pub audit_log_retention: Duration,
    pub audit_log_capacity: usize,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86400);

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            partition_buffer_size: 1024,
            out_of_order_tolerance: 30 * MINUTE,
            journey_window: 30 * DAY,
            dedup_retention: 24 * HOUR,
            dedup_bucket: HOUR,
            time_decay_half_life: 7 * DAY,
            max_open_journeys: 1_000_000,
            max_future_skew: 5 * MINUTE,
            batch_max_size: 500,
            batch_max_age: Duration::from_secs(1),
            max_batch_events: 1000,
            requested_models: AttributionModel::ALL.to_vec(),
            sweep_interval: MINUTE,
            drain_timeout: Duration::from_secs(60),
            sink_retry_initial: Duration::from_millis(200),
            sink_retry_max: Duration::from_secs(30),
            sink_max_attempts: None,
            sink_max_in_flight: 4,
            audit_log_retention: HOUR,
            audit_log_capacity: 10_000,
        }
    }
}

/// Set once by any component that hit a fatal error; ingestion refuses work afterwards.
#[derive(Clone, Default)]
pub struct HaltSignal {
    reason: Arc<Mutex<Option<String>>>,
}

impl HaltSignal {
    pub fn halt(&self, reason: String) {
        let mut current = match self.reason.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.is_none() {
            error!("halting intake: {}", reason);
            *current = Some(reason);
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self.reason.lock() {
            Ok(reason) => reason.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Counters shared by the coordinator, the partitions and the publisher.
#[derive(Default)]
pub struct PipelineStats {
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    pub backpressure: AtomicU64,
    pub late_events: AtomicU64,
    pub journeys_closed: AtomicU64,
    pub journeys_expired: AtomicU64,
    pub results_published: AtomicU64,
    pub failed_batches: AtomicU64,
    pub publish_backlog: AtomicUsize,
    pub batches_in_flight: AtomicUsize,
    dead_late_event: AtomicU64,
    dead_sink_rejected: AtomicU64,
    dead_force_expired: AtomicU64,
}

impl PipelineStats {
    fn dead_letter_counter(&self, reason: DeadLetterReason) -> &AtomicU64 {
        match reason {
            DeadLetterReason::LateEvent => &self.dead_late_event,
            DeadLetterReason::SinkRejected => &self.dead_sink_rejected,
            DeadLetterReason::ForceExpired => &self.dead_force_expired,
        }
    }

    pub fn record_dead_letter(&self, reason: DeadLetterReason) {
        _ = self
            .dead_letter_counter(reason)
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub open_journeys: usize,
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub backpressure: u64,
    pub late_events: u64,
    pub journeys_closed: u64,
    pub journeys_expired: u64,
    pub results_published: u64,
    pub publish_backlog: usize,
    pub batches_in_flight: usize,
    pub failed_batches: u64,
    pub dead_letters: BTreeMap<DeadLetterReason, u64>,
    pub halted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub force_expired: usize,
    pub results_published: u64,
    pub failed_batches: u64,
    pub halted: Option<String>,
}

/// Runs the staged pipeline: normalize at the boundary, then route every event
/// to the partition owning its identity, which dedups, assembles journeys and
/// attributes conversions. Results flow to a single batching publisher.
pub struct Pipeline {
    config: PipelineConfig,
    normalizer: EventNormalizer,
    router: PartitionRouter,
    partitions: Vec<PartitionWorker>,
    publisher_commands: mpsc::Sender<PublisherCommand>,
    publisher: Mutex<Option<JoinHandle<()>>>,
    budget: OpenJourneyBudget,
    audit_log: ExpiredJourneyLog,
    stats: Arc<PipelineStats>,
    halt: HaltSignal,
    draining: AtomicBool,
    clock: Arc<dyn Clock>,
}

enum Pending {
    Done(IngestOutcome),
    Waiting(usize, oneshot::Receiver<IngestOutcome>),
}

impl Pipeline {
    /// Spawns the partition workers and the sink publisher. Must be called from
    /// within a tokio runtime.
    pub fn start(
        config: PipelineConfig,
        sink: Arc<dyn AttributionSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        health: &HealthRegistry,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let halt = HaltSignal::default();
        let budget = OpenJourneyBudget::new(config.max_open_journeys);
        let audit_log = ExpiredJourneyLog::new(
            to_time_duration(config.audit_log_retention),
            config.audit_log_capacity,
        );
        let health_deadline =
            to_time_duration((config.sweep_interval * 3).max(Duration::from_secs(30)));

        let (results_tx, results_rx) =
            mpsc::channel(config.batch_max_size.max(1) * config.sink_max_in_flight.max(1));
        let (publisher_commands, commands_rx) = mpsc::channel(8);

        let publisher = SinkPublisher::new(
            sink,
            dead_letters.clone(),
            RetryPolicy::new(
                2,
                config.sink_retry_initial,
                Some(config.sink_retry_max),
                config.sink_max_attempts,
            ),
            clock.clone(),
        );
        let batching = BatchingPublisher::new(
            publisher,
            BatchConfig {
                max_size: config.batch_max_size,
                max_age: config.batch_max_age,
                max_in_flight: config.sink_max_in_flight,
            },
            stats.clone(),
            halt.clone(),
            health.register("sink-publisher".to_string(), health_deadline),
        );
        let publisher = tokio::spawn(batching.run(results_rx, commands_rx));

        let router = PartitionRouter::new(config.partitions);
        let calculator = AttributionCalculator::new(to_time_duration(config.time_decay_half_life));
        let partitions = (0..router.partitions())
            .map(|partition| {
                let state = PartitionState {
                    partition,
                    dedup: Deduplicator::new(config.dedup_bucket, config.dedup_retention),
                    assembler: JourneyAssembler::new(
                        to_time_duration(config.journey_window),
                        to_time_duration(config.out_of_order_tolerance),
                        budget.clone(),
                    ),
                    calculator: calculator.clone(),
                    models: config.requested_models.clone(),
                    results: results_tx.clone(),
                    dead_letters: dead_letters.clone(),
                    audit_log: audit_log.clone(),
                    stats: stats.clone(),
                    halt: halt.clone(),
                    clock: clock.clone(),
                    health: health.register(format!("partition-{}", partition), health_deadline),
                };
                PartitionWorker::spawn(state, config.partition_buffer_size, config.sweep_interval)
            })
            .collect();

        info!(
            partitions = router.partitions(),
            models = ?config.requested_models,
            "attribution pipeline started"
        );

        Self {
            normalizer: EventNormalizer::new(config.max_future_skew),
            config,
            router,
            partitions,
            publisher_commands,
            publisher: Mutex::new(Some(publisher)),
            budget,
            audit_log,
            stats,
            halt,
            draining: AtomicBool::new(false),
            clock,
        }
    }

    fn check_intake(&self) -> Result<(), PipelineError> {
        if let Some(reason) = self.halt.reason() {
            return Err(PipelineError::Halted(reason));
        }
        if self.draining.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }
        Ok(())
    }

    /// Normalizes the event and queues it on its partition without waiting for space.
    fn dispatch(&self, raw: &RawEvent) -> Pending {
        let event = match self.normalizer.normalize(raw, self.clock.now()) {
            Ok(event) => event,
            Err(e) => {
                _ = self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                counter!(EVENTS_REJECTED_COUNTER, "reason" => e.reason()).increment(1);
                debug!(event_id = ?raw.event_id, "rejected event: {}", e);
                return Pending::Done(IngestOutcome::Rejected(e.to_string()));
            }
        };

        let partition = self.router.route(&event.identity_key);
        let (reply, receiver) = oneshot::channel();
        match self.partitions[partition].try_send(PartitionCommand::Ingest { event, reply }) {
            Ok(()) => Pending::Waiting(partition, receiver),
            Err(mpsc::error::TrySendError::Full(_)) => {
                _ = self.stats.backpressure.fetch_add(1, Ordering::Relaxed);
                counter!(BACKPRESSURE_COUNTER, "cause" => "queue_full").increment(1);
                Pending::Done(IngestOutcome::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Pending::Done(IngestOutcome::Rejected(
                    PipelineError::PartitionUnavailable(partition).to_string(),
                ))
            }
        }
    }

    async fn resolve(pending: Pending) -> Result<IngestOutcome, PipelineError> {
        let outcome = match pending {
            Pending::Done(outcome) => outcome,
            Pending::Waiting(partition, receiver) => receiver
                .await
                .map_err(|_| PipelineError::PartitionUnavailable(partition))?,
        };
        counter!(INGEST_OUTCOMES_COUNTER, "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    pub async fn ingest(&self, raw: RawEvent) -> Result<IngestOutcome, PipelineError> {
        self.check_intake()?;
        Self::resolve(self.dispatch(&raw)).await
    }

    /// Outcomes are returned in input order. All events are queued before any
    /// reply is awaited, so partitions work on the batch in parallel.
    pub async fn ingest_batch(
        &self,
        raws: Vec<RawEvent>,
    ) -> Result<Vec<IngestOutcome>, PipelineError> {
        if raws.len() > self.config.max_batch_events {
            return Err(PipelineError::BatchTooLarge {
                size: raws.len(),
                limit: self.config.max_batch_events,
            });
        }
        self.check_intake()?;
        histogram!(INGEST_BATCH_SIZE_HISTOGRAM).record(raws.len() as f64);

        let pending: Vec<Pending> = raws.iter().map(|raw| self.dispatch(raw)).collect();
        let mut outcomes = Vec::with_capacity(pending.len());
        for pending in pending {
            outcomes.push(Self::resolve_in_batch(pending).await);
        }
        Ok(outcomes)
    }

    /// A partition that dies mid-batch only rejects the events it was holding.
    async fn resolve_in_batch(pending: Pending) -> IngestOutcome {
        match Self::resolve(pending).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("event lost by its partition: {}", e);
                counter!(INGEST_OUTCOMES_COUNTER, "outcome" => "rejected").increment(1);
                IngestOutcome::Rejected(e.to_string())
            }
        }
    }

    /// Runs the expiry sweep on every partition and returns the number of journeys expired.
    pub async fn sweep(&self) -> Result<usize, PipelineError> {
        let mut replies = Vec::with_capacity(self.partitions.len());
        for worker in &self.partitions {
            let (reply, receiver) = oneshot::channel();
            worker
                .send(PartitionCommand::Sweep { reply })
                .await
                .map_err(|_| PipelineError::PartitionUnavailable(worker.partition()))?;
            replies.push((worker.partition(), receiver));
        }

        let mut expired = 0;
        for (partition, reply) in join_all(
            replies
                .into_iter()
                .map(|(partition, receiver)| async move { (partition, receiver.await) }),
        )
        .await
        {
            expired += reply.map_err(|_| PipelineError::PartitionUnavailable(partition))?;
        }
        Ok(expired)
    }

    /// Delivers the publisher's partial batch and waits for all in-flight deliveries.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        let (reply, receiver) = oneshot::channel();
        self.publisher_commands
            .send(PublisherCommand::Flush(reply))
            .await
            .map_err(|_| PipelineError::Halted("sink publisher stopped".to_string()))?;
        receiver
            .await
            .map_err(|_| PipelineError::Halted("sink publisher stopped".to_string()))
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        let stats = &self.stats;
        let dead_letters = [
            DeadLetterReason::LateEvent,
            DeadLetterReason::SinkRejected,
            DeadLetterReason::ForceExpired,
        ]
        .into_iter()
        .map(|reason| {
            (
                reason,
                stats.dead_letter_counter(reason).load(Ordering::Relaxed),
            )
        })
        .collect();

        PipelineStatsSnapshot {
            open_journeys: self.budget.open(),
            accepted: stats.accepted.load(Ordering::Relaxed),
            duplicates: stats.duplicates.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            backpressure: stats.backpressure.load(Ordering::Relaxed),
            late_events: stats.late_events.load(Ordering::Relaxed),
            journeys_closed: stats.journeys_closed.load(Ordering::Relaxed),
            journeys_expired: stats.journeys_expired.load(Ordering::Relaxed),
            results_published: stats.results_published.load(Ordering::Relaxed),
            publish_backlog: stats.publish_backlog.load(Ordering::Relaxed),
            batches_in_flight: stats.batches_in_flight.load(Ordering::Relaxed),
            failed_batches: stats.failed_batches.load(Ordering::Relaxed),
            dead_letters,
            halted: self.halt.reason(),
        }
    }

    /// Journeys that expired without converting, still within the audit retention.
    pub fn expired_journeys(&self) -> Vec<ExpiredJourney> {
        self.audit_log.snapshot(self.clock.now())
    }

    fn take_publisher(&self) -> Option<JoinHandle<()>> {
        match self.publisher.lock() {
            Ok(mut publisher) => publisher.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Stops intake, lets partitions finish or force-expire their journeys
    /// within the drain timeout, then flushes the publisher. Only the first
    /// call drains; later calls and concurrent ingestion get `ShuttingDown`.
    pub async fn drain(&self) -> Result<DrainReport, PipelineError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::ShuttingDown);
        }
        info!(timeout = ?self.config.drain_timeout, "draining attribution pipeline");
        let deadline = Instant::now() + self.config.drain_timeout;

        let mut replies = Vec::with_capacity(self.partitions.len());
        for worker in &self.partitions {
            let (reply, receiver) = oneshot::channel();
            match worker.send(PartitionCommand::Drain { deadline, reply }).await {
                Ok(()) => replies.push(receiver),
                Err(_) => warn!(partition = worker.partition(), "partition already stopped"),
            }
        }

        let mut force_expired = 0;
        for reply in join_all(replies).await {
            match reply {
                Ok(forced) => force_expired += forced,
                Err(_) => warn!("partition stopped before finishing its drain"),
            }
        }

        for worker in &self.partitions {
            worker.join().await;
        }
        // Partitions held the only result senders, so the publisher now flushes and exits.
        if let Some(publisher) = self.take_publisher() {
            if let Err(e) = publisher.await {
                error!("sink publisher panicked during drain: {}", e);
            }
        }

        let report = DrainReport {
            force_expired,
            results_published: self.stats.results_published.load(Ordering::Relaxed),
            failed_batches: self.stats.failed_batches.load(Ordering::Relaxed),
            halted: self.halt.reason(),
        };
        info!(
            force_expired = report.force_expired,
            results_published = report.results_published,
            failed_batches = report.failed_batches,
            "attribution pipeline drained"
        );
        Ok(report)
    }

    /// Aborts every task. Open journeys and undelivered results are lost.
    pub fn stop(&self) {
        self.draining.store(true, Ordering::Release);
        for worker in &self.partitions {
            worker.abort();
        }
        if let Some(publisher) = self.take_publisher() {
            publisher.abort();
        }
        warn!("attribution pipeline stopped without draining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcomes_serialize_with_reasons() {
        assert_eq!(
            serde_json::to_value(IngestOutcome::Accepted).unwrap(),
            json!({"outcome": "accepted"})
        );
        assert_eq!(
            serde_json::to_value(IngestOutcome::Rejected("late".to_string())).unwrap(),
            json!({"outcome": "rejected", "reason": "late"})
        );
    }

    #[test]
    fn halt_keeps_the_first_reason() {
        let halt = HaltSignal::default();
        assert_eq!(halt.reason(), None);
        halt.halt("disk full".to_string());
        halt.halt("second".to_string());
        assert_eq!(halt.reason().as_deref(), Some("disk full"));
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.out_of_order_tolerance, Duration::from_secs(1800));
        assert_eq!(config.journey_window, Duration::from_secs(30 * 86400));
        assert_eq!(config.time_decay_half_life, Duration::from_secs(7 * 86400));
        assert_eq!(config.requested_models.len(), 5);
        assert_eq!(config.sink_max_attempts, None);
    }

    #[tokio::test]
    async fn lost_replies_only_reject_their_own_event() {
        let (reply, receiver) = oneshot::channel();
        drop(reply);

        let outcomes = vec![
            Pipeline::resolve_in_batch(Pending::Done(IngestOutcome::Accepted)).await,
            Pipeline::resolve_in_batch(Pending::Waiting(1, receiver)).await,
            Pipeline::resolve_in_batch(Pending::Done(IngestOutcome::Backpressure)).await,
        ];

        assert_eq!(
            outcomes,
            vec![
                IngestOutcome::Accepted,
                IngestOutcome::Rejected(PipelineError::PartitionUnavailable(1).to_string()),
                IngestOutcome::Backpressure,
            ]
        );
    }
}
