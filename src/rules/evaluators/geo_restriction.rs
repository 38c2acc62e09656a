//! `geo-restriction`: stream's country is outside an allow-list or
//! inside a block-list (spec §4.4 catalogue).

use anyhow::Result;
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;

use crate::model::Severity;

use super::super::{
    types::{ConfidenceSignal, EvaluationInput, EvaluatorOutcome, Rule, RuleType},
    Evaluator,
};

#[derive(Deserialize)]
struct Config {
    #[serde(default)]
    allowed: Vec<String>,
    #[serde(default)]
    blocked: Vec<String>,
}

pub struct GeoRestriction;

impl Evaluator for GeoRestriction {
    fn rule_type(&self) -> RuleType {
        RuleType::GeoRestriction
    }

    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<EvaluatorOutcome>>> {
        async move {
            let config: Config = serde_json::from_value(rule.config.clone())?;

            let Some(geo) = &input.geo else {
                return Ok(None);
            };

            let blocked = config.blocked.iter().any(|c| c.eq_ignore_ascii_case(&geo.country));
            let not_allowed =
                !config.allowed.is_empty() && !config.allowed.iter().any(|c| c.eq_ignore_ascii_case(&geo.country));

            if !blocked && !not_allowed {
                return Ok(None);
            }

            Ok(Some(EvaluatorOutcome {
                severity: Severity::Critical,
                message: format!(
                    "{} streamed from restricted country {}",
                    input.stream.user, geo.country
                ),
                details: serde_json::json!({ "country": geo.country }),
                signals: vec![ConfidenceSignal {
                    name: "geo-restriction",
                    weight: 1.0,
                    value: 100.0,
                }],
            }))
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{geo::GeoInfo, media_server::test_support::stream_default, repository::InMemoryRepository};
    use std::sync::Arc;

    fn input(geo: Option<GeoInfo>) -> EvaluationInput {
        EvaluationInput {
            stream: stream_default(),
            peers: Vec::new(),
            household: Vec::new(),
            geo,
            repository: Arc::new(InMemoryRepository::default()),
            geo_resolver: None,
            now: chrono::Utc::now(),
        }
    }

    fn rule(allowed: &[&str], blocked: &[&str]) -> Rule {
        Rule {
            id: 1,
            rule_type: RuleType::GeoRestriction,
            config: serde_json::json!({ "allowed": allowed, "blocked": blocked }),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn blocked_country_fires() {
        let geo = GeoInfo {
            lat: 0.0,
            lng: 0.0,
            city: "X".into(),
            country: "RU".into(),
            isp: "X".into(),
        };
        let outcome = GeoRestriction
            .evaluate(&rule(&[], &["RU"]), &input(Some(geo)))
            .await
            .unwrap();
        assert!(outcome.is_some());
    }

    #[tokio::test]
    async fn missing_geo_is_skipped() {
        let outcome = GeoRestriction
            .evaluate(&rule(&["US"], &[]), &input(None))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn allowed_country_is_silent() {
        let geo = GeoInfo {
            lat: 0.0,
            lng: 0.0,
            city: "X".into(),
            country: "US".into(),
            isp: "X".into(),
        };
        let outcome = GeoRestriction
            .evaluate(&rule(&["US"], &[]), &input(Some(geo)))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
