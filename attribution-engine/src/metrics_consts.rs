// ==== Ingestion metrics ====
/// Counter for per-event ingestion outcomes (label outcome: accepted/duplicate/rejected/backpressure)
pub const INGEST_OUTCOMES_COUNTER: &str = "attribution_ingest_outcomes_total";

/// Counter for events rejected by the normalizer, labelled by reason code
pub const EVENTS_REJECTED_COUNTER: &str = "attribution_events_rejected_total";

/// Counter for backpressure answers, labelled by cause (queue_full/open_journeys)
pub const BACKPRESSURE_COUNTER: &str = "attribution_backpressure_total";

/// Histogram for the number of events per ingested batch
pub const INGEST_BATCH_SIZE_HISTOGRAM: &str = "attribution_ingest_batch_size";

// ==== Partition state ====
/// Counter for events arriving before their journey's cutoff
pub const LATE_EVENTS_COUNTER: &str = "attribution_late_events_total";

/// Gauge for open journeys, per partition
pub const OPEN_JOURNEYS_GAUGE: &str = "attribution_open_journeys";

/// Gauge for event ids held by the deduplicator, per partition
pub const DEDUP_TRACKED_IDS_GAUGE: &str = "attribution_dedup_tracked_ids";

/// Counter for journeys closed by a conversion
pub const JOURNEYS_CLOSED_COUNTER: &str = "attribution_journeys_closed_total";

/// Counter for journeys that ended without a conversion (label cause: window/rollover/drain)
pub const JOURNEYS_EXPIRED_COUNTER: &str = "attribution_journeys_expired_total";

/// Histogram for the duration of one partition expiry sweep
pub const SWEEP_DURATION_HISTOGRAM: &str = "attribution_sweep_duration_seconds";

/// Gauge for the number of journeys held in the expired-journey audit log
pub const AUDIT_LOG_ENTRIES_GAUGE: &str = "attribution_audit_log_entries";

// ==== Attribution ====
/// Counter for attribution results computed, per model
pub const ATTRIBUTIONS_CALCULATED_COUNTER: &str = "attribution_calculations_total";

/// Histogram for the time spent computing one model over one journey
pub const ATTRIBUTION_DURATION_HISTOGRAM: &str = "attribution_calculation_duration_seconds";

/// Histogram for the touchpoint count of attributed journeys, per model
pub const ATTRIBUTION_JOURNEY_LENGTH_HISTOGRAM: &str = "attribution_journey_length";

// ==== Sink ====
/// Counter for delivered batches (label status: success/failed)
pub const SINK_BATCHES_COUNTER: &str = "attribution_sink_batches_total";

/// Counter for delivery attempts that failed transiently and were retried
pub const SINK_RETRIES_COUNTER: &str = "attribution_sink_retries_total";

/// Histogram for results per delivered batch
pub const SINK_BATCH_SIZE_HISTOGRAM: &str = "attribution_sink_batch_size";

/// Histogram for the time from first attempt to final outcome of a batch
pub const SINK_PUBLISH_DURATION_HISTOGRAM: &str = "attribution_sink_publish_duration_seconds";

/// Gauge for batches currently being delivered
pub const SINK_IN_FLIGHT_GAUGE: &str = "attribution_sink_batches_in_flight";

// ==== Dead letters ====
/// Counter for dead-lettered payloads, labelled by reason
pub const DEAD_LETTERS_COUNTER: &str = "attribution_dead_letters_total";
