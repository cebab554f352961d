use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use time::OffsetDateTime;

use crate::event::Event;
use crate::time::to_time_duration;

/// Time-bucketed set of seen event ids.
///
/// Ids are grouped by `occurred_at` truncated to the bucket granularity, and
/// each bucket is stamped with the ingestion time it was last written. A bucket
/// is forgotten once nothing has been written to it for the retention window,
/// so how far apart events are in event time never decides eviction. Eviction
/// happens lazily on insert and on `evict_expired`. A redelivery that lands
/// after its bucket was evicted is treated as new.
#[derive(Debug)]
pub struct Deduplicator {
    bucket_secs: i64,
    retention: time::Duration,
    seen: HashMap<String, i64>,
    buckets: BTreeMap<i64, Bucket>,
    next_eviction: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct Bucket {
    ids: Vec<String>,
    last_written: OffsetDateTime,
}

impl Deduplicator {
    pub fn new(bucket: Duration, retention: Duration) -> Self {
        Self {
            bucket_secs: (bucket.as_secs() as i64).max(1),
            retention: to_time_duration(retention),
            seen: HashMap::new(),
            buckets: BTreeMap::new(),
            next_eviction: None,
        }
    }

    fn bucket_of(&self, event: &Event) -> i64 {
        event.occurred_at.unix_timestamp().div_euclid(self.bucket_secs)
    }

    pub fn is_duplicate(&self, event: &Event) -> bool {
        self.seen.contains_key(&event.event_id)
    }

    /// Returns true the first time an event id is seen, false on a repeat.
    /// `now` is the ingestion time, not the event time.
    pub fn accept(&mut self, event: &Event, now: OffsetDateTime) -> bool {
        if self.is_duplicate(event) {
            return false;
        }
        if self.next_eviction.is_some_and(|due| due <= now) {
            _ = self.evict_expired(now);
        }

        let bucket = self.bucket_of(event);
        _ = self.seen.insert(event.event_id.clone(), bucket);
        let entry = self.buckets.entry(bucket).or_insert_with(|| Bucket {
            ids: Vec::new(),
            last_written: now,
        });
        entry.ids.push(event.event_id.clone());
        entry.last_written = entry.last_written.max(now);

        if self.next_eviction.is_none() {
            self.next_eviction = Some(now + self.retention);
        }
        true
    }

    /// Drops every bucket not written to within the retention window, returning
    /// how many ids were forgotten.
    pub fn evict_expired(&mut self, now: OffsetDateTime) -> usize {
        let cutoff = now - self.retention;
        let mut evicted = 0;
        let mut next_eviction: Option<OffsetDateTime> = None;

        let seen = &mut self.seen;
        let retention = self.retention;
        self.buckets.retain(|_, bucket| {
            if bucket.last_written <= cutoff {
                for id in bucket.ids.drain(..) {
                    if seen.remove(&id).is_some() {
                        evicted += 1;
                    }
                }
                return false;
            }
            let due = bucket.last_written + retention;
            next_eviction = Some(next_eviction.map_or(due, |current| current.min(due)));
            true
        });

        self.next_eviction = next_eviction;
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::collections::BTreeMap;
    use time::macros::datetime;

    const HOUR: Duration = Duration::from_secs(3600);
    const NOW: OffsetDateTime = datetime!(2024-03-20 00:00 UTC);

    fn event(id: &str, at: OffsetDateTime) -> Event {
        Event {
            event_id: id.to_string(),
            identity_key: "user-1".to_string(),
            channel: "google".to_string(),
            event_type: EventType::Click,
            occurred_at: at,
            revenue: None,
            currency: None,
            campaign_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn repeats_are_rejected() {
        let mut dedup = Deduplicator::new(HOUR, 24 * HOUR);
        let first = event("a", datetime!(2024-03-01 10:00 UTC));

        assert!(!dedup.is_duplicate(&first));
        assert!(dedup.accept(&first, NOW));
        assert!(dedup.is_duplicate(&first));
        assert!(!dedup.accept(&first, NOW));

        // Same id with a different payload is still a duplicate.
        let mut changed = first.clone();
        changed.channel = "facebook".to_string();
        changed.occurred_at = datetime!(2024-03-01 11:30 UTC);
        assert!(!dedup.accept(&changed, NOW));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn peeking_does_not_record() {
        let mut dedup = Deduplicator::new(HOUR, 24 * HOUR);
        let e = event("a", datetime!(2024-03-01 10:00 UTC));
        assert!(!dedup.is_duplicate(&e));
        assert!(dedup.is_empty());
        assert!(dedup.accept(&e, NOW));
    }

    #[test]
    fn event_time_gaps_do_not_evict() {
        let mut dedup = Deduplicator::new(HOUR, 24 * HOUR);
        assert!(dedup.accept(&event("old", datetime!(2024-03-01 00:30 UTC)), NOW));
        // Ten days newer in event time, a second later in ingestion time.
        assert!(dedup.accept(
            &event("new", datetime!(2024-03-11 00:30 UTC)),
            NOW + time::Duration::seconds(1)
        ));

        assert_eq!(dedup.len(), 2);
        assert!(!dedup.accept(
            &event("old", datetime!(2024-03-01 00:30 UTC)),
            NOW + time::Duration::seconds(2)
        ));
    }

    #[test]
    fn idle_buckets_are_evicted_on_insert() {
        let mut dedup = Deduplicator::new(HOUR, 24 * HOUR);
        assert!(dedup.accept(&event("old", datetime!(2024-03-01 00:30 UTC)), NOW));
        assert!(dedup.accept(
            &event("mid", datetime!(2024-03-01 12:00 UTC)),
            NOW + time::Duration::hours(12)
        ));

        let later = NOW + time::Duration::hours(25);
        assert!(dedup.accept(&event("new", datetime!(2024-03-02 01:10 UTC)), later));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.accept(&event("old", datetime!(2024-03-01 00:30 UTC)), later));
        assert!(!dedup.accept(&event("mid", datetime!(2024-03-01 12:00 UTC)), later));
    }

    #[test]
    fn writes_keep_a_bucket_alive() {
        let mut dedup = Deduplicator::new(HOUR, 24 * HOUR);
        assert!(dedup.accept(&event("a", datetime!(2024-03-01 10:00 UTC)), NOW));
        assert!(dedup.accept(
            &event("b", datetime!(2024-03-01 10:20 UTC)),
            NOW + time::Duration::hours(20)
        ));

        assert_eq!(dedup.evict_expired(NOW + time::Duration::hours(30)), 0);
        assert_eq!(dedup.evict_expired(NOW + time::Duration::hours(44)), 2);
        assert!(dedup.is_empty());
    }

    #[test]
    fn sweep_before_retention_is_a_noop() {
        let mut dedup = Deduplicator::new(HOUR, 24 * HOUR);
        assert_eq!(dedup.evict_expired(NOW), 0);
        assert!(dedup.accept(&event("a", datetime!(2024-03-01 10:00 UTC)), NOW));
        assert_eq!(dedup.evict_expired(NOW + time::Duration::hours(23)), 0);
        assert_eq!(dedup.len(), 1);
    }
}
