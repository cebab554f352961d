//! Partition workers own the per-identity state of the pipeline.
//!
//! Identities are spread over a fixed set of workers by hashing their key, so
//! every event of one identity is handled by the same worker, in arrival order:
//! 1. Dedup and journey state need no locking
//! 2. Different identities are processed in parallel
//! 3. A slow worker fills its bounded queue and ingestion answers Backpressure

use std::hash::Hasher;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use metrics::{counter, gauge, histogram};
use siphasher::sip::SipHasher13;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::attribution::{AttributionCalculator, AttributionModel, AttributionResult};
use crate::audit::ExpiredJourneyLog;
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::dedup::Deduplicator;
use crate::error::DeadLetterError;
use crate::event::Event;
use crate::journey::{AssembleError, Journey, JourneyAssembler, JourneyUpdate};
use crate::metrics_consts::{
    BACKPRESSURE_COUNTER, DEDUP_TRACKED_IDS_GAUGE, JOURNEYS_CLOSED_COUNTER,
    JOURNEYS_EXPIRED_COUNTER, LATE_EVENTS_COUNTER, OPEN_JOURNEYS_GAUGE, SWEEP_DURATION_HISTOGRAM,
};
use crate::pipeline::{HaltSignal, IngestOutcome, PipelineStats};
use crate::time::Clock;

/// Maps an identity key onto one of `partitions` workers with SipHash-1-3.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    partitions: usize,
}

impl PartitionRouter {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn route(&self, identity_key: &str) -> usize {
        let mut hasher = SipHasher13::new();
        hasher.write(identity_key.as_bytes());
        let hash = hasher.finish();

        (hash % self.partitions as u64) as usize
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }
}

pub enum PartitionCommand {
    Ingest {
        event: Event,
        reply: oneshot::Sender<IngestOutcome>,
    },
    Sweep {
        reply: oneshot::Sender<usize>,
    },
    /// Final command: the worker exits once the drain is done.
    Drain {
        deadline: Instant,
        reply: oneshot::Sender<usize>,
    },
}

/// Everything one partition owns.
pub struct PartitionState {
    pub partition: usize,
    pub dedup: Deduplicator,
    pub assembler: JourneyAssembler,
    pub calculator: AttributionCalculator,
    pub models: Vec<AttributionModel>,
    pub results: mpsc::Sender<AttributionResult>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub audit_log: ExpiredJourneyLog,
    pub stats: Arc<PipelineStats>,
    pub halt: HaltSignal,
    pub clock: Arc<dyn Clock>,
    pub health: HealthHandle,
}

impl PartitionState {
    async fn handle(&mut self, command: PartitionCommand, sweep_interval: Duration) {
        match command {
            PartitionCommand::Ingest { event, reply } => {
                let outcome = self.ingest(event).await;
                drop(reply.send(outcome));
            }
            PartitionCommand::Sweep { reply } => {
                let expired = self.sweep();
                _ = reply.send(expired);
            }
            PartitionCommand::Drain { deadline, reply } => {
                let forced = self.drain(deadline, sweep_interval).await;
                _ = reply.send(forced);
            }
        }
    }

    async fn ingest(&mut self, event: Event) -> IngestOutcome {
        if self.dedup.is_duplicate(&event) {
            _ = self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.event_id, "duplicate event absorbed");
            return IngestOutcome::Accepted;
        }

        match self.assembler.ingest(event.clone()) {
            Ok(updates) => {
                _ = self.dedup.accept(&event, self.clock.now());
                _ = self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                for update in updates {
                    self.apply(update).await;
                }
                IngestOutcome::Accepted
            }
            Err(AssembleError::Late(late)) => {
                _ = self.dedup.accept(&event, self.clock.now());
                _ = self.stats.late_events.fetch_add(1, Ordering::Relaxed);
                counter!(LATE_EVENTS_COUNTER).increment(1);
                debug!(event_id = %event.event_id, cutoff = %late.cutoff, "late event");
                self.dead_letter(DeadLetterReason::LateEvent, late.to_string(), &event)
                    .await;
                IngestOutcome::Rejected(late.to_string())
            }
            Err(AssembleError::Backpressure) => {
                _ = self.stats.backpressure.fetch_add(1, Ordering::Relaxed);
                counter!(BACKPRESSURE_COUNTER, "cause" => "open_journeys").increment(1);
                IngestOutcome::Backpressure
            }
        }
    }

    async fn apply(&mut self, update: JourneyUpdate) {
        match update {
            JourneyUpdate::Appended {
                identity_key,
                touchpoints,
            } => {
                debug!(identity_key = %identity_key, touchpoints, "journey appended");
            }
            JourneyUpdate::Closed(journey) => {
                _ = self.stats.journeys_closed.fetch_add(1, Ordering::Relaxed);
                counter!(JOURNEYS_CLOSED_COUNTER).increment(1);
                let results = self
                    .calculator
                    .attribute(&journey, &self.models, self.clock.now());
                for result in results {
                    _ = self.stats.publish_backlog.fetch_add(1, Ordering::Relaxed);
                    if self.results.send(result).await.is_err() {
                        _ = self.stats.publish_backlog.fetch_sub(1, Ordering::Relaxed);
                        error!(
                            partition = self.partition,
                            "sink publisher is gone, dropping result"
                        );
                    }
                }
            }
            JourneyUpdate::Expired(journey) => self.record_expired(journey, "rollover"),
        }
    }

    fn record_expired(&self, journey: Journey, cause: &'static str) {
        _ = self.stats.journeys_expired.fetch_add(1, Ordering::Relaxed);
        counter!(JOURNEYS_EXPIRED_COUNTER, "cause" => cause).increment(1);
        debug!(
            identity_key = %journey.identity_key,
            touchpoints = journey.touchpoints.len(),
            cause,
            "journey expired without conversion"
        );
        self.audit_log.record(journey, self.clock.now());
    }

    /// Expires due journeys and old dedup buckets, returning how many journeys expired.
    fn sweep(&mut self) -> usize {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let expired = self.assembler.expire_due(now);
        let count = expired.len();
        for journey in expired {
            self.record_expired(journey, "window");
        }
        let evicted = self.dedup.evict_expired(now);

        let partition = self.partition.to_string();
        gauge!(OPEN_JOURNEYS_GAUGE, "partition" => partition.clone())
            .set(self.assembler.open_count() as f64);
        gauge!(DEDUP_TRACKED_IDS_GAUGE, "partition" => partition).set(self.dedup.len() as f64);
        histogram!(SWEEP_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        if count > 0 || evicted > 0 {
            debug!(partition = self.partition, expired = count, evicted, "sweep");
        }

        match self.halt.reason() {
            Some(_) => self.health.report_status(ComponentStatus::Unhealthy),
            None => self.health.report_healthy(),
        }
        count
    }

    /// Sweeps until nothing is open or the deadline passes, then force-expires
    /// what is left. Returns the number of force-expired journeys.
    async fn drain(&mut self, deadline: Instant, sweep_interval: Duration) -> usize {
        loop {
            _ = self.sweep();
            let now = Instant::now();
            if self.assembler.open_count() == 0 || now >= deadline {
                break;
            }
            sleep(sweep_interval.min(deadline - now)).await;
        }

        let forced = self.assembler.force_expire_all();
        let count = forced.len();
        for journey in forced {
            warn!(
                partition = self.partition,
                identity_key = %journey.identity_key,
                touchpoints = journey.touchpoints.len(),
                "force-expiring open journey on drain"
            );
            _ = self.stats.journeys_expired.fetch_add(1, Ordering::Relaxed);
            counter!(JOURNEYS_EXPIRED_COUNTER, "cause" => "drain").increment(1);
            self.dead_letter(DeadLetterReason::ForceExpired, "drain timeout", &journey)
                .await;
        }
        count
    }

    async fn dead_letter<T: serde::Serialize>(
        &self,
        reason: DeadLetterReason,
        detail: impl Into<String>,
        payload: &T,
    ) {
        let sent = match DeadLetter::new(reason, detail, payload, self.clock.now()) {
            Ok(letter) => self.dead_letters.send(letter).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => self.stats.record_dead_letter(reason),
            Err(DeadLetterError(e)) => {
                error!(partition = self.partition, reason = %reason, "failed to dead-letter: {}", e);
                self.halt
                    .halt(format!("dead-letter storage unavailable: {}", e));
                self.health.report_status(ComponentStatus::Unhealthy);
            }
        }
    }
}

/// Handle to a running partition: its command queue and task.
pub struct PartitionWorker {
    partition: usize,
    sender: mpsc::Sender<PartitionCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionWorker {
    pub fn spawn(state: PartitionState, buffer_size: usize, sweep_interval: Duration) -> Self {
        let partition = state.partition;
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let handle = tokio::spawn(Self::run_worker(state, receiver, sweep_interval));

        Self {
            partition,
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues a command without waiting; fails when the queue is full or the worker is gone.
    pub fn try_send(
        &self,
        command: PartitionCommand,
    ) -> Result<(), mpsc::error::TrySendError<PartitionCommand>> {
        self.sender.try_send(command)
    }

    pub async fn send(
        &self,
        command: PartitionCommand,
    ) -> Result<(), mpsc::error::SendError<PartitionCommand>> {
        self.sender.send(command).await
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    fn take_handle(&self) -> Option<JoinHandle<()>> {
        match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Waits for the worker task to exit. Workers exit after a drain.
    pub async fn join(&self) {
        if let Some(handle) = self.take_handle() {
            match handle.await {
                Ok(()) => debug!(partition = self.partition, "partition worker shut down"),
                Err(e) => warn!(
                    partition = self.partition,
                    "partition worker panicked during shutdown: {}", e
                ),
            }
        }
    }

    pub fn abort(&self) {
        if let Some(handle) = self.take_handle() {
            handle.abort();
        }
    }

    async fn run_worker(
        mut state: PartitionState,
        mut receiver: mpsc::Receiver<PartitionCommand>,
        sweep_interval: Duration,
    ) {
        info!(partition = state.partition, "starting partition worker");
        state.health.report_healthy();

        let mut ticker = interval(sweep_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(command) => {
                        let last = matches!(command, PartitionCommand::Drain { .. });
                        state.handle(command, sweep_interval).await;
                        if last {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    _ = state.sweep();
                }
            }
        }

        state.health.report_stopped();
        info!(partition = state.partition, "partition worker stopped");
    }
}
