use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use metrics::{counter, histogram};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::event::Event;
use crate::journey::Journey;
use crate::metrics_consts::{
    ATTRIBUTIONS_CALCULATED_COUNTER, ATTRIBUTION_DURATION_HISTOGRAM,
    ATTRIBUTION_JOURNEY_LENGTH_HISTOGRAM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstTouch,
    LastTouch,
    Linear,
    TimeDecay,
    PositionBased,
}

impl AttributionModel {
    pub const ALL: [AttributionModel; 5] = [
        AttributionModel::FirstTouch,
        AttributionModel::LastTouch,
        AttributionModel::Linear,
        AttributionModel::TimeDecay,
        AttributionModel::PositionBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionModel::FirstTouch => "first_touch",
            AttributionModel::LastTouch => "last_touch",
            AttributionModel::Linear => "linear",
            AttributionModel::TimeDecay => "time_decay",
            AttributionModel::PositionBased => "position_based",
        }
    }

    /// Credit weight of each touchpoint, in journey order. `deltas` holds the
    /// seconds between each touchpoint and the conversion.
    fn weights(&self, deltas: &[f64], half_life_secs: f64) -> Vec<f64> {
        let n = deltas.len();
        let mut weights = vec![0.0; n];
        if n == 0 {
            return weights;
        }

        match self {
            AttributionModel::FirstTouch => weights[0] = 1.0,
            AttributionModel::LastTouch => weights[n - 1] = 1.0,
            AttributionModel::Linear => weights.fill(1.0 / n as f64),
            AttributionModel::TimeDecay => {
                let min_delta = deltas.iter().copied().fold(f64::INFINITY, f64::min);
                for (weight, delta) in weights.iter_mut().zip(deltas) {
                    *weight = (-(delta - min_delta) / half_life_secs).exp2();
                }
                let total: f64 = weights.iter().sum();
                weights.iter_mut().for_each(|w| *w /= total);
            }
            AttributionModel::PositionBased => match n {
                1 => weights[0] = 1.0,
                2 => weights.fill(0.5),
                _ => {
                    weights.fill(0.2 / (n - 2) as f64);
                    weights[0] = 0.4;
                    weights[n - 1] = 0.4;
                }
            },
        }
        weights
    }
}

impl fmt::Display for AttributionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown attribution model: {0}")]
pub struct UnknownModel(pub String);

impl FromStr for AttributionModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        AttributionModel::ALL
            .into_iter()
            .find(|model| model.as_str() == normalized)
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}

/// Comma-separated list of models, in the order results are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSet(pub Vec<AttributionModel>);

impl Default for ModelSet {
    fn default() -> Self {
        Self(AttributionModel::ALL.to_vec())
    }
}

impl FromStr for ModelSet {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut models = Vec::new();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let model: AttributionModel = part.parse()?;
            if !models.contains(&model) {
                models.push(model);
            }
        }
        if models.is_empty() {
            return Err(UnknownModel(s.to_string()));
        }
        Ok(Self(models))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Credit {
    pub channel: String,
    pub touchpoint_event_id: String,
    pub campaign_id: Option<String>,
    /// 1-based position of the touchpoint in the journey
    pub position: usize,
    pub weight: f64,
    pub attributed_revenue: Decimal,
    pub time_to_conversion_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionResult {
    pub identity_key: String,
    pub model: AttributionModel,
    pub conversion_event_id: String,
    pub revenue: Decimal,
    pub currency: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub converted_at: OffsetDateTime,
    pub journey_length: usize,
    pub time_to_convert_secs: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub calculated_at: OffsetDateTime,
    pub credits: Vec<Credit>,
}

impl AttributionResult {
    /// Upsert key in the downstream store.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.identity_key, self.model, self.conversion_event_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct AttributionCalculator {
    half_life: Duration,
}

impl AttributionCalculator {
    pub fn new(half_life: Duration) -> Self {
        Self { half_life }
    }

    /// One result per model, or nothing when the journey did not convert.
    /// Apart from `calculated_at`, the output only depends on the journey.
    pub fn attribute(
        &self,
        journey: &Journey,
        models: &[AttributionModel],
        now: OffsetDateTime,
    ) -> Vec<AttributionResult> {
        let Some(conversion) = &journey.conversion_event else {
            return Vec::new();
        };

        models
            .iter()
            .map(|model| {
                let started = Instant::now();
                let result = self.attribute_one(journey, conversion, *model, now);

                counter!(ATTRIBUTIONS_CALCULATED_COUNTER, "model" => model.as_str()).increment(1);
                histogram!(ATTRIBUTION_DURATION_HISTOGRAM, "model" => model.as_str())
                    .record(started.elapsed().as_secs_f64());
                histogram!(ATTRIBUTION_JOURNEY_LENGTH_HISTOGRAM, "model" => model.as_str())
                    .record(journey.touchpoints.len() as f64);
                result
            })
            .collect()
    }

    fn attribute_one(
        &self,
        journey: &Journey,
        conversion: &Event,
        model: AttributionModel,
        now: OffsetDateTime,
    ) -> AttributionResult {
        let revenue = conversion.revenue.unwrap_or_default();
        let converted_at = conversion.occurred_at;

        let credits = if journey.touchpoints.is_empty() {
            vec![Credit {
                channel: conversion.channel.clone(),
                touchpoint_event_id: conversion.event_id.clone(),
                campaign_id: conversion.campaign_id.clone(),
                position: 1,
                weight: 1.0,
                attributed_revenue: revenue,
                time_to_conversion_secs: 0,
            }]
        } else {
            let deltas: Vec<f64> = journey
                .touchpoints
                .iter()
                .map(|t| (converted_at - t.occurred_at).as_seconds_f64())
                .collect();
            let weights = model.weights(&deltas, self.half_life.as_seconds_f64());

            let credits: Vec<Credit> = journey
                .touchpoints
                .iter()
                .zip(weights)
                .enumerate()
                .filter(|(_, (_, weight))| *weight > 0.0)
                .map(|(index, (touchpoint, weight))| Credit {
                    channel: touchpoint.channel.clone(),
                    touchpoint_event_id: touchpoint.event_id.clone(),
                    campaign_id: touchpoint.campaign_id.clone(),
                    position: index + 1,
                    weight,
                    attributed_revenue: Decimal::ZERO,
                    time_to_conversion_secs: (converted_at - touchpoint.occurred_at).whole_seconds(),
                })
                .collect();
            split_revenue(credits, revenue)
        };

        let time_to_convert_secs = journey
            .touchpoints
            .first()
            .map(|first| (converted_at - first.occurred_at).whole_seconds())
            .unwrap_or(0);

        debug!(
            identity_key = %journey.identity_key,
            model = %model,
            conversion_event_id = %conversion.event_id,
            credits = credits.len(),
            "attributed conversion"
        );

        AttributionResult {
            identity_key: journey.identity_key.clone(),
            model,
            conversion_event_id: conversion.event_id.clone(),
            revenue,
            currency: conversion.currency.clone(),
            converted_at,
            journey_length: journey.touchpoints.len(),
            time_to_convert_secs,
            calculated_at: now,
            credits,
        }
    }
}

/// Rounds each share of `revenue` to at least cents, and hands the rounding
/// remainder to the last credit so the shares add up to `revenue` exactly.
fn split_revenue(mut credits: Vec<Credit>, revenue: Decimal) -> Vec<Credit> {
    let dp = revenue.scale().max(2);
    let Some((last, rest)) = credits.split_last_mut() else {
        return credits;
    };

    let mut assigned = Decimal::ZERO;
    for credit in rest.iter_mut() {
        let weight = Decimal::from_f64(credit.weight).unwrap_or_default();
        credit.attributed_revenue =
            (revenue * weight).round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
        assigned += credit.attributed_revenue;
    }
    last.attributed_revenue = revenue - assigned;
    credits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::collections::BTreeMap;
    use test_case::test_case;
    use time::macros::datetime;

    const CONVERTED_AT: OffsetDateTime = datetime!(2024-03-31 00:00 UTC);
    const NOW: OffsetDateTime = datetime!(2024-03-31 00:05 UTC);

    fn touch(id: &str, channel: &str, days_before: i64) -> Event {
        Event {
            event_id: id.to_string(),
            identity_key: "user-1".to_string(),
            channel: channel.to_string(),
            event_type: EventType::Click,
            occurred_at: CONVERTED_AT - Duration::days(days_before),
            revenue: None,
            currency: None,
            campaign_id: Some(format!("campaign-{}", id)),
            metadata: BTreeMap::new(),
        }
    }

    fn journey(touchpoints: Vec<Event>, revenue: &str) -> Journey {
        let window_start = touchpoints
            .first()
            .map(|t| t.occurred_at)
            .unwrap_or(CONVERTED_AT);
        Journey {
            identity_key: "user-1".to_string(),
            touchpoints,
            conversion_event: Some(Event {
                event_id: "conv".to_string(),
                identity_key: "user-1".to_string(),
                channel: "organic".to_string(),
                event_type: EventType::Conversion,
                occurred_at: CONVERTED_AT,
                revenue: Some(revenue.parse().unwrap()),
                currency: Some("USD".to_string()),
                campaign_id: None,
                metadata: BTreeMap::new(),
            }),
            window_start,
            window_end: window_start + Duration::days(30),
        }
    }

    fn calculator() -> AttributionCalculator {
        AttributionCalculator::new(Duration::days(7))
    }

    fn attribute(journey: &Journey, model: AttributionModel) -> AttributionResult {
        calculator()
            .attribute(journey, &[model], NOW)
            .pop()
            .unwrap()
    }

    fn revenues(result: &AttributionResult) -> Vec<Decimal> {
        result
            .credits
            .iter()
            .map(|c| c.attributed_revenue)
            .collect()
    }

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn time_decay_two_touchpoints() {
        let journey = journey(vec![touch("a", "facebook", 10), touch("b", "google", 5)], "100.00");
        let result = attribute(&journey, AttributionModel::TimeDecay);

        let a = (-10.0_f64 / 7.0).exp2();
        let b = (-5.0_f64 / 7.0).exp2();
        assert!((result.credits[0].weight - a / (a + b)).abs() < 1e-9);
        assert!((result.credits[1].weight - b / (a + b)).abs() < 1e-9);
        assert!(result.credits[1].weight > result.credits[0].weight);

        assert_eq!(revenues(&result), vec![dec("37.87"), dec("62.13")]);
        assert_eq!(revenues(&result).into_iter().sum::<Decimal>(), dec("100.00"));
    }

    #[test]
    fn time_decay_survives_long_journeys() {
        let calculator = AttributionCalculator::new(Duration::seconds(1));
        let journey = journey(vec![touch("a", "facebook", 29), touch("b", "google", 28)], "10");
        let result = calculator
            .attribute(&journey, &[AttributionModel::TimeDecay], NOW)
            .pop()
            .unwrap();
        assert_eq!(result.credits.len(), 1);
        assert_eq!(result.credits[0].touchpoint_event_id, "b");
        assert_eq!(result.credits[0].attributed_revenue, dec("10"));
    }

    #[test]
    fn position_based_four_touchpoints() {
        let journey = journey(
            vec![
                touch("a", "facebook", 4),
                touch("b", "google", 3),
                touch("c", "email", 2),
                touch("d", "tiktok", 1),
            ],
            "100.00",
        );
        let result = attribute(&journey, AttributionModel::PositionBased);

        let weights: Vec<f64> = result.credits.iter().map(|c| c.weight).collect();
        for (weight, expected) in weights.iter().zip([0.4, 0.1, 0.1, 0.4]) {
            assert!((weight - expected).abs() < 1e-9);
        }
        assert_eq!(
            revenues(&result),
            vec![dec("40.00"), dec("10.00"), dec("10.00"), dec("40.00")]
        );
    }

    #[test]
    fn position_based_two_touchpoints_split_evenly() {
        let journey = journey(vec![touch("a", "facebook", 2), touch("b", "google", 1)], "9.99");
        let result = attribute(&journey, AttributionModel::PositionBased);
        assert_eq!(revenues(&result), vec![dec("5.00"), dec("4.99")]);
    }

    #[test_case(AttributionModel::FirstTouch ; "first touch")]
    #[test_case(AttributionModel::LastTouch ; "last touch")]
    #[test_case(AttributionModel::Linear ; "linear")]
    #[test_case(AttributionModel::TimeDecay ; "time decay")]
    #[test_case(AttributionModel::PositionBased ; "position based")]
    fn single_touchpoint_takes_everything(model: AttributionModel) {
        let journey = journey(vec![touch("a", "facebook", 3)], "42.42");
        let result = attribute(&journey, model);
        assert_eq!(result.credits.len(), 1);
        assert_eq!(result.credits[0].channel, "facebook");
        assert_eq!(result.credits[0].weight, 1.0);
        assert_eq!(result.credits[0].attributed_revenue, dec("42.42"));
        assert_eq!(result.credits[0].time_to_conversion_secs, 3 * 86400);
    }

    #[test_case(AttributionModel::FirstTouch ; "first touch")]
    #[test_case(AttributionModel::LastTouch ; "last touch")]
    #[test_case(AttributionModel::Linear ; "linear")]
    #[test_case(AttributionModel::TimeDecay ; "time decay")]
    #[test_case(AttributionModel::PositionBased ; "position based")]
    fn zero_touchpoints_credit_the_conversion_channel(model: AttributionModel) {
        let journey = journey(vec![], "15.00");
        let result = attribute(&journey, model);
        assert_eq!(result.journey_length, 0);
        assert_eq!(result.time_to_convert_secs, 0);
        assert_eq!(result.credits.len(), 1);
        assert_eq!(result.credits[0].channel, "organic");
        assert_eq!(result.credits[0].touchpoint_event_id, "conv");
        assert_eq!(result.credits[0].attributed_revenue, dec("15.00"));
    }

    #[test_case(AttributionModel::FirstTouch ; "first touch")]
    #[test_case(AttributionModel::LastTouch ; "last touch")]
    #[test_case(AttributionModel::Linear ; "linear")]
    #[test_case(AttributionModel::TimeDecay ; "time decay")]
    #[test_case(AttributionModel::PositionBased ; "position based")]
    fn weights_and_revenue_add_up(model: AttributionModel) {
        let journey = journey(
            vec![
                touch("a", "facebook", 9),
                touch("b", "google", 6),
                touch("c", "email", 6),
                touch("d", "tiktok", 2),
                touch("e", "google", 1),
                touch("f", "email", 0),
            ],
            "100.01",
        );
        let result = attribute(&journey, model);

        let weight_sum: f64 = result.credits.iter().map(|c| c.weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
        assert_eq!(revenues(&result).into_iter().sum::<Decimal>(), dec("100.01"));
    }

    #[test]
    fn first_and_last_touch_pick_the_ends() {
        let journey = journey(
            vec![touch("a", "facebook", 3), touch("b", "google", 2), touch("c", "email", 1)],
            "30",
        );
        let first = attribute(&journey, AttributionModel::FirstTouch);
        assert_eq!(first.credits.len(), 1);
        assert_eq!(first.credits[0].touchpoint_event_id, "a");
        assert_eq!(first.credits[0].position, 1);
        assert_eq!(first.credits[0].campaign_id.as_deref(), Some("campaign-a"));

        let last = attribute(&journey, AttributionModel::LastTouch);
        assert_eq!(last.credits[0].touchpoint_event_id, "c");
        assert_eq!(last.credits[0].position, 3);
    }

    #[test]
    fn linear_remainder_goes_to_the_last_credit() {
        let journey = journey(
            vec![touch("a", "facebook", 3), touch("b", "google", 2), touch("c", "email", 1)],
            "100",
        );
        let result = attribute(&journey, AttributionModel::Linear);
        assert_eq!(
            revenues(&result),
            vec![dec("33.33"), dec("33.33"), dec("33.34")]
        );
    }

    #[test]
    fn results_follow_requested_models() {
        let journey = journey(vec![touch("a", "facebook", 3)], "10");
        let results = calculator().attribute(
            &journey,
            &[AttributionModel::Linear, AttributionModel::FirstTouch],
            NOW,
        );
        let models: Vec<AttributionModel> = results.iter().map(|r| r.model).collect();
        assert_eq!(models, vec![AttributionModel::Linear, AttributionModel::FirstTouch]);

        let result = &results[0];
        assert_eq!(result.key(), "user-1:linear:conv");
        assert_eq!(result.currency.as_deref(), Some("USD"));
        assert_eq!(result.journey_length, 1);
        assert_eq!(result.time_to_convert_secs, 3 * 86400);
        assert_eq!(result.calculated_at, NOW);
    }

    #[test]
    fn unconverted_journeys_produce_nothing() {
        let mut journey = journey(vec![touch("a", "facebook", 3)], "10");
        journey.conversion_event = None;
        assert!(calculator()
            .attribute(&journey, &AttributionModel::ALL, NOW)
            .is_empty());
    }

    #[test]
    fn parses_model_lists() {
        assert_eq!(
            "linear, time-decay,LINEAR".parse::<ModelSet>().unwrap(),
            ModelSet(vec![AttributionModel::Linear, AttributionModel::TimeDecay])
        );
        assert_eq!(
            "first_touch,last_touch,linear,time_decay,position_based"
                .parse::<ModelSet>()
                .unwrap(),
            ModelSet::default()
        );
        assert!("".parse::<ModelSet>().is_err());
        assert_eq!(
            "linear,markov".parse::<ModelSet>(),
            Err(UnknownModel("markov".to_string()))
        );
    }

    #[test]
    fn results_serialize_with_snake_case_models() {
        let journey = journey(vec![touch("a", "facebook", 1)], "10.00");
        let result = attribute(&journey, AttributionModel::PositionBased);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["model"], "position_based");
        assert_eq!(value["converted_at"], "2024-03-31T00:00:00Z");
        assert_eq!(value["credits"][0]["touchpoint_event_id"], "a");
    }
}
