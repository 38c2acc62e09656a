//! `impossible-travel`: the user's previous stream's location is further
//! away than they could plausibly have traveled since (spec §4.4
//! catalogue, testable scenario #6).

use anyhow::Result;
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;

use crate::model::Severity;

use super::super::{
    confidence::haversine_km,
    types::{ConfidenceSignal, EvaluationInput, EvaluatorOutcome, Rule, RuleType},
    Evaluator,
};

#[derive(Deserialize)]
struct Config {
    time_window_hours: i64,
    min_distance_km: f64,
    max_speed_km_h: f64,
}

pub struct ImpossibleTravel;

impl Evaluator for ImpossibleTravel {
    fn rule_type(&self) -> RuleType {
        RuleType::ImpossibleTravel
    }

    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<EvaluatorOutcome>>> {
        async move {
            let config: Config = serde_json::from_value(rule.config.clone())?;

            let (Some(resolver), Some(current_ip), Some(current_geo)) = (
                &input.geo_resolver,
                input.stream.ip_address.as_deref(),
                &input.geo,
            ) else {
                return Ok(None);
            };

            let Some(prior) = input
                .repository
                .get_last_stream_before_time(
                    input.stream.user.clone(),
                    input.now,
                    config.time_window_hours,
                    current_ip.to_string(),
                )
                .await?
            else {
                return Ok(None);
            };

            let Some(prior_geo) = resolver.lookup(&prior.ip_address).await? else {
                return Ok(None);
            };

            let distance = haversine_km(prior_geo.lat, prior_geo.lng, current_geo.lat, current_geo.lng);
            if distance < config.min_distance_km {
                return Ok(None);
            }

            let hours = (input.now - prior.occurred_at).num_seconds() as f64 / 3600.0;
            if hours <= 0.0 {
                return Ok(None);
            }
            let speed = distance / hours;
            if speed <= config.max_speed_km_h {
                return Ok(None);
            }

            let ratio = speed / config.max_speed_km_h;
            let severity = if ratio >= 2.0 {
                Severity::Critical
            } else if ratio >= 1.5 {
                Severity::Warning
            } else {
                Severity::Info
            };

            Ok(Some(EvaluatorOutcome {
                severity,
                message: format!(
                    "{} traveled {distance:.0} km in {hours:.1}h ({speed:.0} km/h, limit {})",
                    input.stream.user, config.max_speed_km_h
                ),
                details: serde_json::json!({
                    "distance_km": distance,
                    "hours": hours,
                    "speed_km_h": speed,
                }),
                signals: vec![ConfidenceSignal {
                    name: "speed-ratio",
                    weight: 1.0,
                    value: (ratio * 50.0).min(100.0),
                }],
            }))
        }
        .boxed()
    }
}
