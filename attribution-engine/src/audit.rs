use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use metrics::gauge;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::journey::Journey;
use crate::metrics_consts::AUDIT_LOG_ENTRIES_GAUGE;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpiredJourney {
    pub journey: Journey,
    #[serde(with = "time::serde::rfc3339")]
    pub expired_at: OffsetDateTime,
}

/// Short-lived record of journeys that ended without converting.
///
/// Shared by all partitions. Entries older than the retention, or beyond the
/// capacity (oldest first), are dropped on every write.
#[derive(Clone)]
pub struct ExpiredJourneyLog {
    retention: Duration,
    capacity: usize,
    entries: Arc<Mutex<VecDeque<ExpiredJourney>>>,
}

impl ExpiredJourneyLog {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            retention,
            capacity,
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn record(&self, journey: Journey, now: OffsetDateTime) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_back(ExpiredJourney {
            journey,
            expired_at: now,
        });
        while entries.len() > self.capacity {
            drop(entries.pop_front());
        }
        self.evict(&mut entries, now);
        gauge!(AUDIT_LOG_ENTRIES_GAUGE).set(entries.len() as f64);
    }

    /// Entries still within retention at `now`, oldest first.
    pub fn snapshot(&self, now: OffsetDateTime) -> Vec<ExpiredJourney> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.evict(&mut entries, now);
        entries.iter().cloned().collect()
    }

    fn evict(&self, entries: &mut VecDeque<ExpiredJourney>, now: OffsetDateTime) {
        let horizon = now - self.retention;
        while entries
            .front()
            .is_some_and(|entry| entry.expired_at < horizon)
        {
            drop(entries.pop_front());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn journey(identity: &str) -> Journey {
        Journey {
            identity_key: identity.to_string(),
            touchpoints: Vec::new(),
            conversion_event: None,
            window_start: datetime!(2024-03-01 00:00 UTC),
            window_end: datetime!(2024-03-31 00:00 UTC),
        }
    }

    fn identities(entries: &[ExpiredJourney]) -> Vec<&str> {
        entries
            .iter()
            .map(|e| e.journey.identity_key.as_str())
            .collect()
    }

    #[test]
    fn entries_age_out() {
        let log = ExpiredJourneyLog::new(Duration::hours(1), 100);
        log.record(journey("a"), datetime!(2024-03-31 00:30 UTC));
        log.record(journey("b"), datetime!(2024-03-31 01:00 UTC));

        let snapshot = log.snapshot(datetime!(2024-03-31 01:00 UTC));
        assert_eq!(identities(&snapshot), vec!["a", "b"]);

        let snapshot = log.snapshot(datetime!(2024-03-31 01:31 UTC));
        assert_eq!(identities(&snapshot), vec!["b"]);
    }

    #[test]
    fn capacity_drops_oldest() {
        let log = ExpiredJourneyLog::new(Duration::hours(1), 2);
        let now = datetime!(2024-03-31 00:30 UTC);
        log.record(journey("a"), now);
        log.record(journey("b"), now);
        log.record(journey("c"), now);
        assert_eq!(identities(&log.snapshot(now)), vec!["b", "c"]);
    }
}
