use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::DeadLetterError;
use crate::metrics_consts::DEAD_LETTERS_COUNTER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Event arrived before its journey's out-of-order cutoff
    LateEvent,
    /// A result batch the sink refused or that ran out of retries
    SinkRejected,
    /// Open journey expired by a drain before its window closed
    ForceExpired,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::LateEvent => "late_event",
            DeadLetterReason::SinkRejected => "sink_rejected",
            DeadLetterReason::ForceExpired => "force_expired",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload the pipeline gave up on, with the reason it was set aside.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    pub detail: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl DeadLetter {
    pub fn new<T: Serialize>(
        reason: DeadLetterReason,
        detail: impl Into<String>,
        payload: &T,
        recorded_at: OffsetDateTime,
    ) -> Result<Self, DeadLetterError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| DeadLetterError(format!("failed to serialize payload: {}", e)))?;
        Ok(Self {
            reason,
            detail: detail.into(),
            payload,
            recorded_at,
        })
    }
}

/// Storage for dead letters. An error here is fatal: the pipeline halts intake
/// rather than lose payloads.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Writes dead letters to the log.
pub struct LogDeadLetterSink {}

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        counter!(DEAD_LETTERS_COUNTER, "reason" => letter.reason.as_str()).increment(1);
        warn!(
            reason = %letter.reason,
            detail = %letter.detail,
            payload = %letter.payload,
            "dead letter"
        );
        Ok(())
    }
}

/// Keeps dead letters in memory, for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDeadLetterSink {
    pub fn letters(&self) -> Vec<DeadLetter> {
        match self.letters.lock() {
            Ok(letters) => letters.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn with_reason(&self, reason: DeadLetterReason) -> Vec<DeadLetter> {
        self.letters()
            .into_iter()
            .filter(|letter| letter.reason == reason)
            .collect()
    }

    /// Makes every following `send` fail, to simulate storage loss.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeadLetterError("memory dead-letter sink unavailable".to_string()));
        }
        counter!(DEAD_LETTERS_COUNTER, "reason" => letter.reason.as_str()).increment(1);
        self.letters
            .lock()
            .map_err(|_| DeadLetterError("poisoned dead-letter buffer".to_string()))?
            .push(letter);
        Ok(())
    }
}
