use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::attribution::AttributionResult;
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::error::{SinkDeliveryError, SinkError};
use crate::metrics_consts::{
    SINK_BATCHES_COUNTER, SINK_BATCH_SIZE_HISTOGRAM, SINK_IN_FLIGHT_GAUGE,
    SINK_PUBLISH_DURATION_HISTOGRAM, SINK_RETRIES_COUNTER,
};
use crate::pipeline::{HaltSignal, PipelineStats};
use crate::retry::RetryPolicy;
use crate::time::Clock;

/// The external store. Writes are upserts keyed by `AttributionResult::key`,
/// so a batch delivered twice is harmless.
#[async_trait]
pub trait AttributionSink: Send + Sync {
    async fn write_batch(&self, batch: &[AttributionResult]) -> Result<(), SinkError>;
}

pub struct PrintSink {}

#[async_trait]
impl AttributionSink for PrintSink {
    async fn write_batch(&self, batch: &[AttributionResult]) -> Result<(), SinkError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of attribution results");
        let _enter = span.enter();

        for result in batch {
            info!(
                key = %result.key(),
                revenue = %result.revenue,
                credits = ?result
                    .credits
                    .iter()
                    .map(|c| (c.channel.as_str(), c.attributed_revenue))
                    .collect::<Vec<_>>(),
                "attribution result"
            );
        }
        Ok(())
    }
}

/// Delivers one batch with retries, dead-lettering it if it cannot be delivered.
#[derive(Clone)]
pub struct SinkPublisher {
    sink: Arc<dyn AttributionSink>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SinkPublisher {
    pub fn new(
        sink: Arc<dyn AttributionSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            dead_letters,
            retry_policy,
            clock,
        }
    }

    /// Transient errors are retried in place, so only this batch waits on the
    /// backoff. A `DeadLetter` error means the batch is lost and should halt the pipeline.
    pub async fn publish(&self, batch: Vec<AttributionResult>) -> Result<(), SinkDeliveryError> {
        let started = Instant::now();
        let size = batch.len();
        let mut attempts: u32 = 0;

        let outcome = loop {
            attempts += 1;
            match self.sink.write_batch(&batch).await {
                Ok(()) => break Ok(()),
                Err(SinkError::Transient(reason)) => {
                    if !self.retry_policy.should_retry(attempts) {
                        break Err(SinkDeliveryError::RetriesExhausted {
                            size,
                            attempts,
                            reason,
                        });
                    }
                    let backoff = self.retry_policy.time_until_next_retry(attempts - 1);
                    warn!(
                        size,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient sink error, retrying batch: {}",
                        reason
                    );
                    counter!(SINK_RETRIES_COUNTER).increment(1);
                    sleep(backoff).await;
                }
                Err(SinkError::Permanent(reason)) => {
                    break Err(SinkDeliveryError::Rejected { size, reason });
                }
            }
        };

        histogram!(SINK_PUBLISH_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        match outcome {
            Ok(()) => {
                counter!(SINK_BATCHES_COUNTER, "status" => "success").increment(1);
                histogram!(SINK_BATCH_SIZE_HISTOGRAM).record(size as f64);
                debug!(size, attempts, "delivered batch");
                Ok(())
            }
            Err(failure) => {
                counter!(SINK_BATCHES_COUNTER, "status" => "failed").increment(1);
                error!("failed to deliver batch: {}", failure);
                let letter = DeadLetter::new(
                    DeadLetterReason::SinkRejected,
                    failure.to_string(),
                    &batch,
                    self.clock.now(),
                )?;
                self.dead_letters.send(letter).await?;
                Err(failure)
            }
        }
    }
}

pub enum PublisherCommand {
    /// Deliver the partial batch now and reply once every delivery has finished.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_age: Duration,
    pub max_in_flight: usize,
}

/// Batching loop in front of a `SinkPublisher`.
///
/// Results are grouped until the batch is full or its oldest result reaches
/// `max_age`. At most `max_in_flight` batches are delivered at once; while all
/// slots are taken the loop stops reading `results`, so the bounded channel
/// fills up and partitions feel the backpressure.
pub struct BatchingPublisher {
    publisher: SinkPublisher,
    config: BatchConfig,
    stats: Arc<PipelineStats>,
    halt: HaltSignal,
    health: HealthHandle,
    slots: Arc<Semaphore>,
    deliveries: JoinSet<()>,
    batch: Vec<AttributionResult>,
    deadline: Option<Instant>,
}

impl BatchingPublisher {
    pub fn new(
        publisher: SinkPublisher,
        config: BatchConfig,
        stats: Arc<PipelineStats>,
        halt: HaltSignal,
        health: HealthHandle,
    ) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        let max_size = config.max_size.max(1);
        Self {
            publisher,
            config: BatchConfig {
                max_size,
                max_in_flight,
                ..config
            },
            stats,
            halt,
            health,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            deliveries: JoinSet::new(),
            batch: Vec::with_capacity(max_size),
            deadline: None,
        }
    }

    pub async fn run(
        mut self,
        mut results: mpsc::Receiver<AttributionResult>,
        mut commands: mpsc::Receiver<PublisherCommand>,
    ) {
        info!(
            max_size = self.config.max_size,
            max_in_flight = self.config.max_in_flight,
            "starting sink publisher"
        );
        let mut heartbeat = interval(Duration::from_secs(10));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = results.recv() => match received {
                    Some(result) => self.push(result).await,
                    None => break,
                },
                _ = sleep_until(self.deadline.unwrap_or_else(Instant::now)), if self.deadline.is_some() => {
                    self.dispatch().await;
                }
                Some(command) = commands.recv() => match command {
                    PublisherCommand::Flush(reply) => {
                        while let Ok(result) = results.try_recv() {
                            self.push(result).await;
                        }
                        self.dispatch().await;
                        self.wait_for_deliveries().await;
                        _ = reply.send(());
                    }
                },
                Some(finished) = self.deliveries.join_next() => {
                    if let Err(e) = finished {
                        error!("sink delivery task failed: {}", e);
                    }
                }
                _ = heartbeat.tick() => self.health.report_healthy(),
            }
        }

        self.dispatch().await;
        self.wait_for_deliveries().await;
        self.health.report_stopped();
        info!("sink publisher stopped");
    }

    async fn push(&mut self, result: AttributionResult) {
        if self.batch.is_empty() {
            self.deadline = Some(Instant::now() + self.config.max_age);
        }
        self.batch.push(result);
        if self.batch.len() >= self.config.max_size {
            self.dispatch().await;
        }
    }

    /// Hands the current batch to a delivery task, waiting for a free slot first.
    async fn dispatch(&mut self) {
        self.deadline = None;
        if self.batch.is_empty() {
            return;
        }

        let permit = match self.acquire_slot().await {
            Some(permit) => permit,
            None => return,
        };
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.config.max_size));
        let size = batch.len();
        let publisher = self.publisher.clone();
        let stats = self.stats.clone();
        let halt = self.halt.clone();

        _ = stats.batches_in_flight.fetch_add(1, Ordering::Relaxed);
        gauge!(SINK_IN_FLIGHT_GAUGE).increment(1.0);
        drop(self.deliveries.spawn(async move {
            let _permit = permit;
            match publisher.publish(batch).await {
                Ok(()) => {
                    _ = stats.results_published.fetch_add(size as u64, Ordering::Relaxed);
                }
                Err(SinkDeliveryError::DeadLetter(e)) => {
                    _ = stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                    halt.halt(format!("lost a batch of {} results: {}", size, e));
                }
                Err(_) => {
                    _ = stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                    stats.record_dead_letter(DeadLetterReason::SinkRejected);
                }
            }
            _ = stats.publish_backlog.fetch_sub(size, Ordering::Relaxed);
            _ = stats.batches_in_flight.fetch_sub(1, Ordering::Relaxed);
            gauge!(SINK_IN_FLIGHT_GAUGE).decrement(1.0);
        }));
    }

    /// Waits for a delivery slot while reaping finished deliveries.
    async fn acquire_slot(&mut self) -> Option<OwnedSemaphorePermit> {
        loop {
            tokio::select! {
                permit = self.slots.clone().acquire_owned() => return permit.ok(),
                Some(finished) = self.deliveries.join_next() => {
                    if let Err(e) = finished {
                        error!("sink delivery task failed: {}", e);
                    }
                }
            }
        }
    }

    async fn wait_for_deliveries(&mut self) {
        while let Some(finished) = self.deliveries.join_next().await {
            if let Err(e) = finished {
                error!("sink delivery task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::{AttributionModel, Credit};
    use crate::dead_letter::MemoryDeadLetterSink;
    use crate::time::ManualClock;
    use health::HealthRegistry;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use time::macros::datetime;

    /// Fails with the queued errors first, then records every batch it accepts.
    #[derive(Default)]
    struct ScriptedSink {
        failures: Mutex<Vec<SinkError>>,
        calls: AtomicU32,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedSink {
        fn failing_with(failures: Vec<SinkError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttributionSink for ScriptedSink {
        async fn write_batch(&self, batch: &[AttributionResult]) -> Result<(), SinkError> {
            _ = self.calls.fetch_add(1, Ordering::SeqCst);
            let failure = {
                let mut failures = self.failures.lock().unwrap();
                (!failures.is_empty()).then(|| failures.remove(0))
            };
            if let Some(failure) = failure {
                return Err(failure);
            }
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|r| r.key()).collect());
            Ok(())
        }
    }

    fn result(identity: &str) -> AttributionResult {
        AttributionResult {
            identity_key: identity.to_string(),
            model: AttributionModel::Linear,
            conversion_event_id: "conv".to_string(),
            revenue: Decimal::new(1000, 2),
            currency: None,
            converted_at: datetime!(2024-03-01 12:00 UTC),
            journey_length: 1,
            time_to_convert_secs: 60,
            calculated_at: datetime!(2024-03-01 12:01 UTC),
            credits: vec![Credit {
                channel: "google".to_string(),
                touchpoint_event_id: "click".to_string(),
                campaign_id: None,
                position: 1,
                weight: 1.0,
                attributed_revenue: Decimal::new(1000, 2),
                time_to_conversion_secs: 60,
            }],
        }
    }

    fn fast_retries(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy::new(
            2,
            Duration::from_millis(1),
            Some(Duration::from_millis(5)),
            max_attempts,
        )
    }

    fn publisher(
        sink: Arc<ScriptedSink>,
        dead_letters: MemoryDeadLetterSink,
        max_attempts: Option<u32>,
    ) -> SinkPublisher {
        SinkPublisher::new(
            sink,
            Arc::new(dead_letters),
            fast_retries(max_attempts),
            Arc::new(ManualClock::new(datetime!(2024-03-01 12:05 UTC))),
        )
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let sink = Arc::new(ScriptedSink::failing_with(vec![
            SinkError::Transient("timeout".to_string()),
            SinkError::Transient("timeout".to_string()),
        ]));
        let dead_letters = MemoryDeadLetterSink::default();
        let publisher = publisher(sink.clone(), dead_letters.clone(), None);

        publisher.publish(vec![result("user-1")]).await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.batches(), vec![vec!["user-1:linear:conv".to_string()]]);
        assert!(dead_letters.letters().is_empty());
    }

    #[tokio::test]
    async fn permanent_errors_are_dead_lettered() {
        let sink = Arc::new(ScriptedSink::failing_with(vec![SinkError::Permanent(
            "schema mismatch".to_string(),
        )]));
        let dead_letters = MemoryDeadLetterSink::default();
        let publisher = publisher(sink.clone(), dead_letters.clone(), None);

        let err = publisher
            .publish(vec![result("user-1"), result("user-2")])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkDeliveryError::Rejected { size: 2, .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        let letters = dead_letters.with_reason(DeadLetterReason::SinkRejected);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload.as_array().map(Vec::len), Some(2));
        assert_eq!(letters[0].payload[0]["identity_key"], "user-1");
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let sink = Arc::new(ScriptedSink::failing_with(vec![
            SinkError::Transient("unavailable".to_string());
            5
        ]));
        let dead_letters = MemoryDeadLetterSink::default();
        let publisher = publisher(sink.clone(), dead_letters.clone(), Some(2));

        let err = publisher.publish(vec![result("user-1")]).await.unwrap_err();
        assert!(matches!(
            err,
            SinkDeliveryError::RetriesExhausted { attempts: 2, .. }
        ));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dead_letters.letters().len(), 1);
    }

    #[tokio::test]
    async fn lost_batches_surface_as_dead_letter_errors() {
        let sink = Arc::new(ScriptedSink::failing_with(vec![SinkError::Permanent(
            "nope".to_string(),
        )]));
        let dead_letters = MemoryDeadLetterSink::default();
        dead_letters.set_unavailable(true);
        let publisher = publisher(sink, dead_letters, None);

        let err = publisher.publish(vec![result("user-1")]).await.unwrap_err();
        assert!(matches!(err, SinkDeliveryError::DeadLetter(_)));
    }

    fn batching(sink: Arc<ScriptedSink>, max_size: usize, max_age: Duration) -> BatchingPublisher {
        let registry = HealthRegistry::new("liveness");
        BatchingPublisher::new(
            publisher(sink, MemoryDeadLetterSink::default(), None),
            BatchConfig {
                max_size,
                max_age,
                max_in_flight: 1,
            },
            Arc::new(PipelineStats::default()),
            HaltSignal::default(),
            registry.register("sink-publisher".to_string(), time::Duration::seconds(30)),
        )
    }

    #[tokio::test]
    async fn batches_are_cut_by_size_and_flushed_on_close() {
        let sink = Arc::new(ScriptedSink::default());
        let (results_tx, results_rx) = mpsc::channel(16);
        let (_commands_tx, commands_rx) = mpsc::channel(1);
        let task = tokio::spawn(
            batching(sink.clone(), 2, Duration::from_secs(3600)).run(results_rx, commands_rx),
        );

        for identity in ["a", "b", "c"] {
            results_tx.send(result(identity)).await.unwrap();
        }
        drop(results_tx);
        task.await.unwrap();

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn flush_delivers_the_partial_batch() {
        let sink = Arc::new(ScriptedSink::default());
        let (results_tx, results_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let task = tokio::spawn(
            batching(sink.clone(), 100, Duration::from_secs(3600)).run(results_rx, commands_rx),
        );

        results_tx.send(result("a")).await.unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        commands_tx
            .send(PublisherCommand::Flush(reply_tx))
            .await
            .unwrap();
        reply_rx.await.unwrap();
        assert_eq!(sink.batches(), vec![vec!["a:linear:conv".to_string()]]);

        drop(results_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn old_batches_are_sent_after_max_age() {
        let sink = Arc::new(ScriptedSink::default());
        let (results_tx, results_rx) = mpsc::channel(16);
        let (_commands_tx, commands_rx) = mpsc::channel(1);
        let task = tokio::spawn(
            batching(sink.clone(), 100, Duration::from_millis(20)).run(results_rx, commands_rx),
        );

        results_tx.send(result("a")).await.unwrap();
        for _ in 0..100 {
            if !sink.batches().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.batches().len(), 1);

        drop(results_tx);
        task.await.unwrap();
    }
}
