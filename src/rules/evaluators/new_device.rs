//! `new-device`: first time this (player, platform) pair has been seen
//! for this user (spec §4.4 catalogue). Only active when the rule opts
//! into `notify_on_new`.

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
    notify_on_new: bool,
}

pub struct NewDevice;

impl Evaluator for NewDevice {
    fn rule_type(&self) -> RuleType {
        RuleType::NewDevice
    }

    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<EvaluatorOutcome>>> {
        async move {
            let config: Config = serde_json::from_value(rule.config.clone())?;
            if !config.notify_on_new {
                return Ok(None);
            }

            let seen = input
                .repository
                .has_device_been_used(
                    input.stream.user.clone(),
                    input.stream.player.clone(),
                    input.stream.platform.clone(),
                )
                .await?;
            if seen {
                return Ok(None);
            }

            Ok(Some(EvaluatorOutcome {
                severity: Severity::Info,
                message: format!(
                    "{} streamed from a new device: {} on {}",
                    input.stream.user, input.stream.player, input.stream.platform
                ),
                details: serde_json::json!({
                    "player": input.stream.player,
                    "platform": input.stream.platform,
                }),
                signals: vec![ConfidenceSignal {
                    name: "first-seen-device",
                    weight: 1.0,
                    value: 60.0,
                }],
            }))
        }
        .boxed()
    }
}
