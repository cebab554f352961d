use thiserror::Error;
use time::OffsetDateTime;

use crate::event::EventType;

/// Permanent rejection of a raw event at the ingestion boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("event submitted without {0}")]
    MissingField(&'static str),
    #[error("unknown event_type: {0}")]
    UnknownEventType(String),
    #[error("occurred_at could not be parsed: {0}")]
    InvalidTimestamp(String),
    #[error("occurred_at is {ahead_secs}s in the future, beyond the allowed clock skew")]
    TimestampInFuture { ahead_secs: i64 },
    #[error("revenue must not be negative")]
    NegativeRevenue,
    #[error("revenue is only allowed on conversion events, got a {0} event")]
    RevenueNotAllowed(EventType),
}

impl NormalizationError {
    /// Short reason code, used as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizationError::MissingField(_) => "missing_field",
            NormalizationError::UnknownEventType(_) => "unknown_event_type",
            NormalizationError::InvalidTimestamp(_) => "invalid_timestamp",
            NormalizationError::TimestampInFuture { .. } => "timestamp_in_future",
            NormalizationError::NegativeRevenue => "negative_revenue",
            NormalizationError::RevenueNotAllowed(_) => "revenue_not_allowed",
        }
    }
}

/// An event that arrived too late to be placed in its identity's journey.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event {event_id} for {identity_key} occurred at {occurred_at}, before the journey cutoff {cutoff}")]
pub struct LateEventError {
    pub event_id: String,
    pub identity_key: String,
    pub occurred_at: OffsetDateTime,
    pub cutoff: OffsetDateTime,
}

/// Errors returned by an `AttributionSink` implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient sink error: {0}")]
    Transient(String),
    #[error("sink rejected the batch: {0}")]
    Permanent(String),
}

/// Final outcome of a batch the publisher could not deliver.
#[derive(Error, Debug)]
pub enum SinkDeliveryError {
    #[error("batch of {size} results rejected by the sink: {reason}")]
    Rejected { size: usize, reason: String },
    #[error("gave up on batch of {size} results after {attempts} attempts: {reason}")]
    RetriesExhausted {
        size: usize,
        attempts: u32,
        reason: String,
    },
    #[error("failed batch could not be dead-lettered: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dead-letter storage unavailable: {0}")]
pub struct DeadLetterError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline is draining, no new events are accepted")]
    ShuttingDown,
    #[error("pipeline halted after a fatal error: {0}")]
    Halted(String),
    #[error("batch of {size} events exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("partition {0} is no longer running")]
    PartitionUnavailable(usize),
}
