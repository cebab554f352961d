use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::error::LateEventError;
use crate::event::Event;

/// Ordered touchpoints of one identity, leading to at most one conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Journey {
    pub identity_key: String,
    /// Non-conversion events, sorted by `Event::journey_order`
    pub touchpoints: Vec<Event>,
    pub conversion_event: Option<Event>,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
}

impl Journey {
    fn open(first: Event, window: Duration) -> Self {
        let window_start = first.occurred_at;
        Self {
            identity_key: first.identity_key.clone(),
            touchpoints: vec![first],
            conversion_event: None,
            window_start,
            window_end: window_start + window,
        }
    }

    fn insert(&mut self, event: Event) {
        match self
            .touchpoints
            .binary_search_by(|existing| existing.journey_order(&event))
        {
            Ok(_) => {}
            Err(position) => self.touchpoints.insert(position, event),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JourneyUpdate {
    Appended {
        identity_key: String,
        touchpoints: usize,
    },
    Closed(Journey),
    Expired(Journey),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error(transparent)]
    Late(#[from] LateEventError),
    #[error("open journey limit reached")]
    Backpressure,
}

/// Count of open journeys shared by every partition, bounded by `max_open`.
#[derive(Debug, Clone)]
pub struct OpenJourneyBudget {
    open: Arc<AtomicUsize>,
    max_open: usize,
}

impl OpenJourneyBudget {
    pub fn new(max_open: usize) -> Self {
        Self {
            open: Arc::new(AtomicUsize::new(0)),
            max_open,
        }
    }

    pub fn try_reserve(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max_open).then_some(open + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                open.checked_sub(1)
            });
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

/// Per-partition journey state machine.
///
/// A journey opens on the first non-conversion event of an identity and then
/// either closes on a conversion, or expires once its window (plus the
/// out-of-order tolerance) has passed on the clock.
pub struct JourneyAssembler {
    window: Duration,
    tolerance: Duration,
    budget: OpenJourneyBudget,
    open: HashMap<String, Journey>,
}

impl JourneyAssembler {
    pub fn new(window: Duration, tolerance: Duration, budget: OpenJourneyBudget) -> Self {
        Self {
            window,
            tolerance,
            budget,
            open: HashMap::new(),
        }
    }

    pub fn ingest(&mut self, event: Event) -> Result<Vec<JourneyUpdate>, AssembleError> {
        let mut updates = Vec::new();

        let Some(journey) = self.open.get_mut(&event.identity_key) else {
            updates.push(self.start(event, false)?);
            return Ok(updates);
        };

        let cutoff = journey.window_start - self.tolerance;
        if event.occurred_at < cutoff {
            return Err(LateEventError {
                event_id: event.event_id,
                identity_key: event.identity_key,
                occurred_at: event.occurred_at,
                cutoff,
            }
            .into());
        }

        if event.occurred_at > journey.window_end {
            // Rolls over: the open journey keeps its reservation for the next one.
            if let Some(expired) = self.open.remove(&event.identity_key) {
                updates.push(JourneyUpdate::Expired(expired));
            }
            updates.push(self.start(event, true)?);
            return Ok(updates);
        }

        if event.is_conversion() {
            if let Some(journey) = self.open.remove(&event.identity_key) {
                updates.push(self.close(journey, event));
            }
            return Ok(updates);
        }

        journey.insert(event);
        updates.push(JourneyUpdate::Appended {
            identity_key: journey.identity_key.clone(),
            touchpoints: journey.touchpoints.len(),
        });
        Ok(updates)
    }

    /// Begins a new journey for an identity with nothing open. A conversion
    /// closes straight away with no touchpoints and holds no reservation.
    fn start(&mut self, event: Event, reserved: bool) -> Result<JourneyUpdate, AssembleError> {
        if event.is_conversion() {
            if reserved {
                self.budget.release();
            }
            let converted_at = event.occurred_at;
            return Ok(JourneyUpdate::Closed(Journey {
                identity_key: event.identity_key.clone(),
                touchpoints: Vec::new(),
                conversion_event: Some(event),
                window_start: converted_at,
                window_end: converted_at + self.window,
            }));
        }

        if !reserved && !self.budget.try_reserve() {
            return Err(AssembleError::Backpressure);
        }
        let journey = Journey::open(event, self.window);
        let update = JourneyUpdate::Appended {
            identity_key: journey.identity_key.clone(),
            touchpoints: 1,
        };
        drop(self.open.insert(journey.identity_key.clone(), journey));
        Ok(update)
    }

    fn close(&mut self, mut journey: Journey, conversion: Event) -> JourneyUpdate {
        let split = journey
            .touchpoints
            .partition_point(|t| t.occurred_at <= conversion.occurred_at);
        let carried = journey.touchpoints.split_off(split);

        let mut carried = carried.into_iter();
        match carried.next() {
            Some(first) => {
                let mut next = Journey::open(first, self.window);
                carried.for_each(|event| next.insert(event));
                drop(self.open.insert(next.identity_key.clone(), next));
            }
            None => self.budget.release(),
        }

        journey.conversion_event = Some(conversion);
        JourneyUpdate::Closed(journey)
    }

    /// Removes every journey whose window plus tolerance has passed at `now`.
    pub fn expire_due(&mut self, now: OffsetDateTime) -> Vec<Journey> {
        let due: Vec<String> = self
            .open
            .iter()
            .filter(|(_, journey)| journey.window_end + self.tolerance <= now)
            .map(|(identity, _)| identity.clone())
            .collect();

        let mut expired: Vec<Journey> = due
            .iter()
            .filter_map(|identity| self.open.remove(identity))
            .collect();
        expired.iter().for_each(|_| self.budget.release());
        expired.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        expired
    }

    /// Expires everything still open, regardless of window.
    pub fn force_expire_all(&mut self) -> Vec<Journey> {
        let mut expired: Vec<Journey> = self.open.drain().map(|(_, journey)| journey).collect();
        expired.iter().for_each(|_| self.budget.release());
        expired.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        expired
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn has_open(&self, identity_key: &str) -> bool {
        self.open.contains_key(identity_key)
    }
}
