//! `device-velocity`: too many distinct (player, platform) pairs for a
//! user in a short window (spec §4.4 catalogue).

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
    time_window_hours: i64,
    max_devices_per_hour: i64,
}

pub struct DeviceVelocity;

impl Evaluator for DeviceVelocity {
    fn rule_type(&self) -> RuleType {
        RuleType::DeviceVelocity
    }

    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<EvaluatorOutcome>>> {
        async move {
            let config: Config = serde_json::from_value(rule.config.clone())?;

            let mut devices = input
                .repository
                .get_recent_devices(input.stream.user.clone(), config.time_window_hours)
                .await?;
            let current = (input.stream.player.clone(), input.stream.platform.clone());
            if !devices.contains(&current) {
                devices.push(current);
            }

            if devices.len() as i64 <= config.max_devices_per_hour {
                return Ok(None);
            }

            Ok(Some(EvaluatorOutcome {
                severity: Severity::Warning,
                message: format!(
                    "{} used {} distinct devices in the last {}h",
                    input.stream.user,
                    devices.len(),
                    config.time_window_hours
                ),
                details: serde_json::json!({ "device_count": devices.len() }),
                signals: vec![ConfidenceSignal {
                    name: "device-count",
                    weight: 1.0,
                    value: (devices.len() as f64 / config.max_devices_per_hour as f64 * 50.0).min(100.0),
                }],
            }))
        }
        .boxed()
    }
}
