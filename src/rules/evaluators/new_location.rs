//! `new-location`: current IP is unseen and far from every previously
//! known IP for this user (spec §4.4 catalogue). A user's first-ever
//! stream never qualifies — there is nothing to compare against yet.

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
    min_distance_km: f64,
    #[serde(default)]
    exempt_household: bool,
    #[serde(default = "default_lookback_hours")]
    lookback_hours: i64,
}

fn default_lookback_hours() -> i64 {
    24 * 365
}

pub struct NewLocation;

impl Evaluator for NewLocation {
    fn rule_type(&self) -> RuleType {
        RuleType::NewLocation
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

            if config.exempt_household && input.is_trusted_household_ip(current_ip) {
                return Ok(None);
            }

            let known_ips = input
                .repository
                .get_user_distinct_ips(input.stream.user.clone(), config.lookback_hours)
                .await?;

            if known_ips.is_empty() {
                // First-ever stream: nothing to compare against.
                return Ok(None);
            }
            if known_ips.iter().any(|ip| ip == current_ip) {
                return Ok(None);
            }

            let mut min_distance = f64::MAX;
            for ip in &known_ips {
                if let Some(geo) = resolver.lookup(ip).await? {
                    let d = haversine_km(geo.lat, geo.lng, current_geo.lat, current_geo.lng);
                    min_distance = min_distance.min(d);
                }
            }
            if min_distance < config.min_distance_km {
                return Ok(None);
            }

            Ok(Some(EvaluatorOutcome {
                severity: Severity::Warning,
                message: format!(
                    "{} streamed from a new location at least {min_distance:.0} km from any known IP",
                    input.stream.user
                ),
                details: serde_json::json!({ "min_distance_km": min_distance }),
                signals: vec![ConfidenceSignal {
                    name: "new-location-distance",
                    weight: 1.0,
                    value: (min_distance / config.min_distance_km * 50.0).min(100.0),
                }],
            }))
        }
        .boxed()
    }
}
