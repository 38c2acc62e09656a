//! `concurrent-streams`: flags a user streaming more sessions at once
//! than their plan/policy allows (spec §4.4 catalogue).

use anyhow::Result;
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;

use crate::model::Severity;

use super::super::{
    confidence::combine,
    types::{ConfidenceSignal, EvaluationInput, EvaluatorOutcome, Rule, RuleType},
    Evaluator,
};

#[derive(Deserialize)]
struct Config {
    max_streams: i64,
    #[serde(default)]
    exempt_household: bool,
}

pub struct ConcurrentStreams;

impl Evaluator for ConcurrentStreams {
    fn rule_type(&self) -> RuleType {
        RuleType::ConcurrentStreams
    }

    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<EvaluatorOutcome>>> {
        async move {
            let config: Config = serde_json::from_value(rule.config.clone())?;

            let peers: Vec<_> = input
                .peers
                .iter()
                .filter(|p| p.user == input.stream.user)
                .collect();
            let count = peers.len() as i64;
            if count <= config.max_streams {
                return Ok(None);
            }

            if config.exempt_household
                && peers.iter().all(|p| {
                    p.ip_address
                        .as_deref()
                        .is_some_and(|ip| input.is_trusted_household_ip(ip))
                })
            {
                return Ok(None);
            }

            let excess = count - config.max_streams;
            let severity = if excess >= 3 {
                Severity::Critical
            } else if excess >= 2 {
                Severity::Warning
            } else {
                Severity::Info
            };

            let signals = vec![ConfidenceSignal {
                name: "stream-excess",
                weight: 1.0,
                value: (excess as f64 * 25.0).min(100.0),
            }];

            Ok(Some(EvaluatorOutcome {
                severity,
                message: format!(
                    "{} has {count} concurrent streams (limit {})",
                    input.stream.user, config.max_streams
                ),
                details: serde_json::json!({ "count": count, "max_streams": config.max_streams }),
                signals,
            }))
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{media_server::test_support::stream_default, repository::InMemoryRepository};
    use std::sync::Arc;

    fn input(peers: Vec<crate::model::ActiveStream>) -> EvaluationInput {
        EvaluationInput {
            stream: stream_default(),
            peers,
            household: Vec::new(),
            geo: None,
            repository: Arc::new(InMemoryRepository::default()),
            geo_resolver: None,
            now: chrono::Utc::now(),
        }
    }

    fn rule(max_streams: i64, exempt_household: bool) -> Rule {
        Rule {
            id: 1,
            rule_type: RuleType::ConcurrentStreams,
            config: serde_json::json!({ "max_streams": max_streams, "exempt_household": exempt_household }),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn fires_on_excess() {
        let mut other = stream_default();
        other.session_id = "s2".into();
        let input = input(vec![stream_default(), other]);
        let outcome = ConcurrentStreams
            .evaluate(&rule(1, false), &input)
            .await
            .unwrap();
        assert!(outcome.is_some());
        assert_eq!(combine(&outcome.unwrap().signals), 25);
    }

    #[tokio::test]
    async fn under_limit_is_silent() {
        let input = input(vec![stream_default()]);
        let outcome = ConcurrentStreams
            .evaluate(&rule(1, false), &input)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
