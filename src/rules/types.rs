//! Shared types for the rules engine: the rule tag, the evaluator input,
//! and the confidence signal vector every evaluator contributes to
//! (spec §4.4, §9 "dynamic dispatch on rule type").

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    geo::{GeoInfo, GeoResolver},
    model::{ActiveStream, HouseholdLocation, Severity},
    repository::Repository,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    ConcurrentStreams,
    GeoRestriction,
    SimultaneousLocations,
    ImpossibleTravel,
    DeviceVelocity,
    NewDevice,
    NewLocation,
    IspVelocity,
}

/// A configured rule. `config` is an opaque blob the engine never
/// inspects; only the evaluator registered for `rule_type` parses it.
#[derive(Clone, Debug)]
pub struct Rule {
    pub id: i64,
    pub rule_type: RuleType,
    pub config: serde_json::Value,
    pub enabled: bool,
}

/// One contribution to an evaluator's confidence score. `value` is in
/// `0.0..=100.0`; `weight` need not be normalized, [`super::confidence::combine`]
/// does that.
#[derive(Clone, Debug)]
pub struct ConfidenceSignal {
    pub name: &'static str,
    pub weight: f64,
    pub value: f64,
}

/// What an evaluator hands back to the engine when a rule fires. The
/// engine fills in `rule_id`, `session_key`, `confidence`, and
/// `occurred_at` — those are the same across every evaluator, so they
/// live outside this type rather than being repeated by each one.
pub struct EvaluatorOutcome {
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub signals: Vec<ConfidenceSignal>,
}

/// Everything an evaluator needs: the session under evaluation, its
/// peers (other active streams, for cross-session rules), the user's
/// household exemptions, the stream's own resolved geo (if available),
/// and handles to the repository/geo resolver for rules that need
/// historical lookups.
pub struct EvaluationInput {
    pub stream: ActiveStream,
    pub peers: Vec<ActiveStream>,
    pub household: Vec<HouseholdLocation>,
    pub geo: Option<GeoInfo>,
    pub repository: Arc<dyn Repository>,
    pub geo_resolver: Option<Arc<dyn GeoResolver>>,
    pub now: DateTime<Utc>,
}

impl EvaluationInput {
    pub fn is_trusted_household_ip(&self, ip: &str) -> bool {
        self.household
            .iter()
            .any(|h| h.trusted && h.ip_address == ip)
    }
}
