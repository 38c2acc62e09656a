//! Rules engine (spec §4.4): a TTL-cached list of enabled rules, a
//! per-session evaluation pass over a tag-keyed evaluator registry, and
//! detached notification dispatch tracked by a wait group.

pub mod confidence;
pub mod evaluators;
pub mod types;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, warn};

use crate::{
    geo::GeoResolver,
    model::{ActiveStream, RuleViolation},
    notify::Notifier,
    repository::Repository,
};

use types::{EvaluationInput, Rule, RuleType};

pub trait Evaluator: Send + Sync {
    fn rule_type(&self) -> RuleType;
    fn evaluate<'a>(
        &'a self,
        rule: &'a Rule,
        input: &'a EvaluationInput,
    ) -> BoxFuture<'a, Result<Option<types::EvaluatorOutcome>>>;
}

fn default_registry() -> HashMap<RuleType, Box<dyn Evaluator>> {
    let all: Vec<Box<dyn Evaluator>> = vec![
        Box::new(evaluators::ConcurrentStreams),
        Box::new(evaluators::GeoRestriction),
        Box::new(evaluators::SimultaneousLocations),
        Box::new(evaluators::ImpossibleTravel),
        Box::new(evaluators::DeviceVelocity),
        Box::new(evaluators::NewDevice),
        Box::new(evaluators::NewLocation),
        Box::new(evaluators::IspVelocity),
    ];
    all.into_iter().map(|e| (e.rule_type(), e)).collect()
}

struct CachedRules {
    rules: Arc<Vec<Rule>>,
    fetched_at: Instant,
}

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RulesEngine {
    repository: Arc<dyn Repository>,
    geo_resolver: Option<Arc<dyn GeoResolver>>,
    notifier: Option<Arc<dyn Notifier>>,
    evaluators: HashMap<RuleType, Box<dyn Evaluator>>,
    cache: RwLock<Option<CachedRules>>,
    cache_ttl: Duration,
    cooldown: Duration,
    notifications: Mutex<Vec<JoinHandle<()>>>,
}

impl RulesEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        geo_resolver: Option<Arc<dyn GeoResolver>>,
        notifier: Option<Arc<dyn Notifier>>,
        cache_ttl: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            repository,
            geo_resolver,
            notifier,
            evaluators: default_registry(),
            cache: RwLock::new(None),
            cache_ttl,
            cooldown,
            notifications: Mutex::new(Vec::new()),
        }
    }

    /// Read lock first; only if stale, promote to a write lock with a
    /// double-check (spec §9 "rule cache hot path").
    pub async fn enabled_rules(&self) -> Result<Arc<Vec<Rule>>> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.rules.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.rules.clone());
            }
        }

        let rules = Arc::new(self.repository.list_enabled_rules().await?);
        *cache = Some(CachedRules {
            rules: rules.clone(),
            fetched_at: Instant::now(),
        });
        Ok(rules)
    }

    pub async fn refresh(&self) -> Result<Arc<Vec<Rule>>> {
        let rules = Arc::new(self.repository.list_enabled_rules().await?);
        *self.cache.write().await = Some(CachedRules {
            rules: rules.clone(),
            fetched_at: Instant::now(),
        });
        Ok(rules)
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    /// Single entry point the poller calls per active session (spec §9:
    /// "poller depends on engine via an interface with a single
    /// evaluate_session(stream, all) method").
    pub async fn evaluate_session(&self, stream: ActiveStream, all: &[ActiveStream]) -> Result<()> {
        let rules = self.enabled_rules().await?;
        if rules.is_empty() {
            return Ok(());
        }

        let household = self
            .repository
            .list_trusted_household_locations(stream.user.clone())
            .await?;

        let geo = match (&self.geo_resolver, stream.ip_address.as_deref()) {
            (Some(resolver), Some(ip)) => resolver.lookup(ip).await.unwrap_or_else(|err| {
                warn!(user = %stream.user, "geo lookup failed, evaluating without geo: {err:#}");
                None
            }),
            _ => None,
        };

        let input = EvaluationInput {
            stream: stream.clone(),
            peers: all.to_vec(),
            household,
            geo,
            repository: self.repository.clone(),
            geo_resolver: self.geo_resolver.clone(),
            now: Utc::now(),
        };

        for rule in rules.iter() {
            let Some(evaluator) = self.evaluators.get(&rule.rule_type) else {
                error!(rule_type = ?rule.rule_type, "no evaluator registered for rule type");
                continue;
            };

            let outcome = match evaluator.evaluate(rule, &input).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(err) => {
                    error!(rule_id = rule.id, "rule evaluation failed, skipping: {err:#}");
                    continue;
                }
            };

            self.fire(rule, &stream, outcome).await?;
        }

        Ok(())
    }

    async fn fire(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        outcome: types::EvaluatorOutcome,
    ) -> Result<()> {
        let session_key = stream.session_id.clone();

        let duplicate = self
            .repository
            .violation_exists_recent(rule.id, stream.user.clone(), session_key.clone(), self.cooldown)
            .await?;
        if duplicate {
            debug!(rule_id = rule.id, user = %stream.user, "violation suppressed by cooldown");
            return Ok(());
        }

        let confidence = confidence::combine(&outcome.signals);
        let violation = RuleViolation {
            rule_id: rule.id,
            user: stream.user.clone(),
            severity: outcome.severity,
            message: outcome.message,
            details: outcome.details,
            confidence,
            occurred_at: Utc::now(),
            session_key,
        };

        let decrement = outcome.severity.default_decrement();
        self.repository
            .insert_violation_with_tx(violation.clone(), decrement)
            .await?;

        if let Some(notifier) = self.notifier.clone() {
            let channels = self.repository.get_channels_for_rule(rule.id).await?;
            for channel_id in channels {
                let notifier = notifier.clone();
                let violation = violation.clone();
                let handle = tokio::spawn(async move {
                    match timeout(NOTIFICATION_TIMEOUT, notifier.notify(channel_id, &violation)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!("notification delivery failed: {err:#}"),
                        Err(_) => warn!(channel_id, "notification delivery timed out"),
                    }
                });
                self.notifications.lock().await.push(handle);
            }
        }

        Ok(())
    }

    /// Blocks at shutdown for in-flight notification tasks (spec §5, §9
    /// shutdown ordering step 4).
    pub async fn wait_for_notifications(&self) {
        let handles = std::mem::take(&mut *self.notifications.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{media_server::test_support::stream_default, repository::InMemoryRepository};

    fn rule(id: i64) -> Rule {
        Rule {
            id,
            rule_type: RuleType::ConcurrentStreams,
            config: serde_json::json!({ "max_streams": 0 }),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn cache_is_stable_within_ttl() {
        let repo = Arc::new(InMemoryRepository::with_rules(vec![rule(1)]));
        let engine = RulesEngine::new(repo, None, None, Duration::from_secs(300), Duration::from_secs(900));

        let first = engine.enabled_rules().await.unwrap();
        let second = engine.enabled_rules().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let repo = Arc::new(InMemoryRepository::with_rules(vec![rule(1)]));
        let engine = RulesEngine::new(repo, None, None, Duration::from_secs(300), Duration::from_secs(900));

        let first = engine.enabled_rules().await.unwrap();
        engine.invalidate_cache().await;
        let second = engine.enabled_rules().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn violation_decrements_trust_score() {
        let repo = Arc::new(InMemoryRepository::with_rules(vec![rule(1)]));
        let engine = RulesEngine::new(
            repo.clone(),
            None,
            None,
            Duration::from_secs(300),
            Duration::from_secs(900),
        );

        let stream = stream_default();
        engine.evaluate_session(stream.clone(), &[stream]).await.unwrap();

        let score = repo.trust_score("alice");
        assert_eq!(score.score, 95);
        assert_eq!(score.violation_count, 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_duplicate() {
        let repo = Arc::new(InMemoryRepository::with_rules(vec![rule(1)]));
        let engine = RulesEngine::new(
            repo.clone(),
            None,
            None,
            Duration::from_secs(300),
            Duration::from_secs(900),
        );

        let stream = stream_default();
        engine.evaluate_session(stream.clone(), &[stream.clone()]).await.unwrap();
        engine.evaluate_session(stream.clone(), &[stream]).await.unwrap();

        assert_eq!(repo.violations().len(), 1);
    }
}
