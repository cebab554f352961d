use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::NormalizationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Impression,
    Click,
    Install,
    Conversion,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Impression => "impression",
            EventType::Click => "click",
            EventType::Install => "install",
            EventType::Conversion => "conversion",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = NormalizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "impression" => Ok(EventType::Impression),
            "click" => Ok(EventType::Click),
            "install" => Ok(EventType::Install),
            "conversion" => Ok(EventType::Conversion),
            _ => Err(NormalizationError::UnknownEventType(s.to_string())),
        }
    }
}

/// An event as handed over by the ingestion gateway, before any validation.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    pub event_id: Option<String>,
    pub identity_key: Option<String>,
    pub channel: Option<String>,
    pub event_type: Option<String>,
    pub occurred_at: Option<Value>,
    pub revenue: Option<Decimal>,
    pub currency: Option<String>,
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub identity_key: String,
    pub channel: String,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub revenue: Option<Decimal>,
    pub currency: Option<String>,
    pub campaign_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn is_conversion(&self) -> bool {
        self.event_type == EventType::Conversion
    }

    /// Journey order: event time, then event id so equal timestamps sort the same way every run.
    pub fn journey_order(&self, other: &Event) -> Ordering {
        self.occurred_at
            .cmp(&other.occurred_at)
            .then_with(|| self.event_id.cmp(&other.event_id))
    }
}

/// Validates raw events and turns them into canonical `Event`s.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    max_future_skew: Duration,
}

impl EventNormalizer {
    pub fn new(max_future_skew: Duration) -> Self {
        Self { max_future_skew }
    }

    /// `now` is only used for the future skew check, the result is otherwise a pure
    /// function of the raw event.
    pub fn normalize(
        &self,
        raw: &RawEvent,
        now: OffsetDateTime,
    ) -> Result<Event, NormalizationError> {
        let event_id = required(&raw.event_id, "event_id")?;
        let identity_key = required(&raw.identity_key, "identity_key")?;
        let channel = required(&raw.channel, "channel")?.to_lowercase();
        let event_type: EventType = required(&raw.event_type, "event_type")?.parse()?;

        let occurred_at = match &raw.occurred_at {
            None | Some(Value::Null) => return Err(NormalizationError::MissingField("occurred_at")),
            Some(value) => parse_occurred_at(value)?,
        };
        if occurred_at > now + self.max_future_skew {
            return Err(NormalizationError::TimestampInFuture {
                ahead_secs: (occurred_at - now).whole_seconds(),
            });
        }

        let revenue = match (event_type, raw.revenue) {
            (EventType::Conversion, None) => return Err(NormalizationError::MissingField("revenue")),
            (EventType::Conversion, Some(revenue)) if revenue < Decimal::ZERO => {
                return Err(NormalizationError::NegativeRevenue)
            }
            (EventType::Conversion, Some(revenue)) => Some(revenue),
            (other, Some(_)) => return Err(NormalizationError::RevenueNotAllowed(other)),
            (_, None) => None,
        };

        let currency = match event_type {
            EventType::Conversion => non_empty(&raw.currency).map(|c| c.to_ascii_uppercase()),
            _ => None,
        };

        Ok(Event {
            event_id,
            identity_key,
            channel,
            event_type,
            occurred_at,
            revenue,
            currency,
            campaign_id: non_empty(&raw.campaign_id),
            metadata: raw
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, NormalizationError> {
    non_empty(value).ok_or(NormalizationError::MissingField(field))
}

/// Accepts RFC 3339 strings and unix timestamps. Integers below 10^10 are
/// seconds, anything larger is milliseconds.
pub fn parse_occurred_at(value: &Value) -> Result<OffsetDateTime, NormalizationError> {
    let invalid = || NormalizationError::InvalidTimestamp(value.to_string());

    let millis = match value {
        Value::Number(number) => number.as_i64().ok_or_else(invalid)?,
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
                return Ok(parsed.to_offset(time::UtcOffset::UTC));
            }
            text.parse::<i64>().map_err(|_| invalid())?
        }
        _ => return Err(invalid()),
    };

    let millis = if millis.abs() < 10_000_000_000 {
        millis.checked_mul(1000).ok_or_else(invalid)?
    } else {
        millis
    };

    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|_| invalid())
}
