//! `simultaneous-locations`: the same user appears to be streaming from
//! two or more distant places at once (spec §4.4 catalogue).

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
}

pub struct SimultaneousLocations;

impl Evaluator for SimultaneousLocations {
    fn rule_type(&self) -> RuleType {
        RuleType::SimultaneousLocations
    }

    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<EvaluatorOutcome>>> {
        async move {
            let config: Config = serde_json::from_value(rule.config.clone())?;

            let Some(resolver) = &input.geo_resolver else {
                return Ok(None);
            };

            let mut points = Vec::new();
            if let Some(geo) = &input.geo {
                points.push((geo.city.clone(), geo.country.clone(), geo.lat, geo.lng));
            }

            for peer in input.peers.iter().filter(|p| {
                p.user == input.stream.user && p.session_id != input.stream.session_id
            }) {
                let Some(ip) = peer.ip_address.as_deref() else {
                    continue;
                };
                if config.exempt_household && input.is_trusted_household_ip(ip) {
                    continue;
                }
                if let Some(geo) = resolver.lookup(ip).await? {
                    points.push((geo.city, geo.country, geo.lat, geo.lng));
                }
            }

            let mut distinct: Vec<&(String, String, f64, f64)> = Vec::new();
            for p in &points {
                if !distinct.iter().any(|d| d.0 == p.0 && d.1 == p.1) {
                    distinct.push(p);
                }
            }
            if distinct.len() < 2 {
                return Ok(None);
            }

            let mut max_distance = 0.0_f64;
            for i in 0..distinct.len() {
                for j in (i + 1)..distinct.len() {
                    let d = haversine_km(distinct[i].2, distinct[i].3, distinct[j].2, distinct[j].3);
                    max_distance = max_distance.max(d);
                }
            }

            if max_distance < config.min_distance_km {
                return Ok(None);
            }

            let severity = if max_distance >= config.min_distance_km * 5.0 {
                Severity::Critical
            } else if max_distance >= config.min_distance_km * 2.0 {
                Severity::Warning
            } else {
                Severity::Info
            };

            Ok(Some(EvaluatorOutcome {
                severity,
                message: format!(
                    "{} is streaming from {} distinct locations up to {max_distance:.0} km apart",
                    input.stream.user,
                    distinct.len()
                ),
                details: serde_json::json!({ "max_distance_km": max_distance, "locations": distinct.len() }),
                signals: vec![ConfidenceSignal {
                    name: "max-distance",
                    weight: 1.0,
                    value: (max_distance / config.min_distance_km * 50.0).min(100.0),
                }],
            }))
        }
        .boxed()
    }
}
