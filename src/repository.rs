//! The persisted-state boundary (spec §6). The core never speaks SQL; it
//! calls this trait and treats the storage layer as an injected black box
//! that may serialize writers or fail with a conflict error.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::{FutureExt, future::BoxFuture};

use crate::{
    model::{HouseholdLocation, LibraryItemCache, RuleViolation, UserTrustScore, WatchHistoryEntry},
    rules::types::Rule,
};

/// Most recent stream the repository can recall for impossible-travel and
/// new-location checks. Only the fields those evaluators need.
#[derive(Clone, Debug)]
pub struct PriorStream {
    pub ip_address: String,
    pub occurred_at: DateTime<Utc>,
}

pub trait Repository: Send + Sync {
    fn insert_history(&self, entry: WatchHistoryEntry) -> BoxFuture<'_, Result<()>>;

    fn list_items_for_libraries(
        &self,
        pairs: Vec<(i64, i64)>,
    ) -> BoxFuture<'_, Result<Vec<LibraryItemCache>>>;
    fn get_cross_server_watch_times(
        &self,
        item_ids: Vec<i64>,
    ) -> BoxFuture<'_, Result<HashMap<i64, Option<DateTime<Utc>>>>>;

    fn list_enabled_rules(&self) -> BoxFuture<'_, Result<Vec<Rule>>>;
    fn get_channels_for_rule(&self, rule_id: i64) -> BoxFuture<'_, Result<Vec<i64>>>;

    fn get_user_trust_score(&self, user: String) -> BoxFuture<'_, Result<UserTrustScore>>;
    fn insert_violation_with_tx(
        &self,
        violation: RuleViolation,
        decrement: i64,
    ) -> BoxFuture<'_, Result<()>>;
    fn violation_exists_recent(
        &self,
        rule_id: i64,
        user: String,
        session_key: String,
        cooldown: Duration,
    ) -> BoxFuture<'_, Result<bool>>;

    fn get_last_stream_before_time(
        &self,
        user: String,
        before: DateTime<Utc>,
        within_hours: i64,
        excluding_ip: String,
    ) -> BoxFuture<'_, Result<Option<PriorStream>>>;
    fn has_device_been_used(
        &self,
        user: String,
        player: String,
        platform: String,
    ) -> BoxFuture<'_, Result<bool>>;
    fn get_user_distinct_ips(
        &self,
        user: String,
        within_hours: i64,
    ) -> BoxFuture<'_, Result<Vec<String>>>;
    fn get_recent_devices(
        &self,
        user: String,
        within_hours: i64,
    ) -> BoxFuture<'_, Result<Vec<(String, String)>>>;
    fn get_recent_isps(
        &self,
        user: String,
        within_hours: i64,
    ) -> BoxFuture<'_, Result<Vec<String>>>;

    fn list_trusted_household_locations(
        &self,
        user: String,
    ) -> BoxFuture<'_, Result<Vec<HouseholdLocation>>>;
    fn auto_learn_household_location(
        &self,
        user: String,
        ip_address: String,
        min_sessions: i64,
    ) -> BoxFuture<'_, Result<()>>;

    fn get_watched_threshold(&self) -> BoxFuture<'_, Result<i64>>;
    fn get_idle_timeout_minutes(&self) -> BoxFuture<'_, Result<i64>>;
}

#[derive(Default)]
struct State {
    history: Vec<WatchHistoryEntry>,
    library_items: Vec<LibraryItemCache>,
    rules: Vec<Rule>,
    channels: HashMap<i64, Vec<i64>>,
    trust: HashMap<String, UserTrustScore>,
    violations: Vec<RuleViolation>,
    household: HashMap<String, Vec<HouseholdLocation>>,
    session_ips: HashMap<String, Vec<(DateTime<Utc>, String)>>,
    session_isps: HashMap<String, Vec<(DateTime<Utc>, String)>>,
    watched_threshold: i64,
    idle_timeout_minutes: i64,
}

/// A synchronous, process-local stand-in for the real repository. Used by
/// the test suite for every component that would otherwise need a
/// database (mirrors the role `httpmock` plays for HTTP integrations).
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                watched_threshold: 85,
                idle_timeout_minutes: 30,
                ..State::default()
            }),
        }
    }
}

impl InMemoryRepository {
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        let repo = Self::default();
        repo.state.lock().unwrap().rules = rules;
        repo
    }

    pub fn seed_library_items(&self, items: Vec<LibraryItemCache>) {
        self.state.lock().unwrap().library_items.extend(items);
    }

    /// Test hook: record a historical (user, ip, time) triple directly,
    /// without going through `insert_history`, so evaluator tests can seed
    /// prior-stream state without a full `WatchHistoryEntry`.
    pub fn seed_session_ip(&self, user: &str, ip: &str, at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .session_ips
            .entry(user.to_string())
            .or_default()
            .push((at, ip.to_string()));
    }

    /// Test hook: record a historical (user, isp, time) triple directly,
    /// mirroring [`Self::seed_session_ip`] for the ISP-velocity evaluator.
    pub fn seed_session_isp(&self, user: &str, isp: &str, at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .session_isps
            .entry(user.to_string())
            .or_default()
            .push((at, isp.to_string()));
    }

    pub fn trust_score(&self, user: &str) -> UserTrustScore {
        self.state
            .lock()
            .unwrap()
            .trust
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn violations(&self) -> Vec<RuleViolation> {
        self.state.lock().unwrap().violations.clone()
    }

    pub fn history(&self) -> Vec<WatchHistoryEntry> {
        self.state.lock().unwrap().history.clone()
    }
}

impl Repository for InMemoryRepository {
    fn list_items_for_libraries(
        &self,
        pairs: Vec<(i64, i64)>,
    ) -> BoxFuture<'_, Result<Vec<LibraryItemCache>>> {
        async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .library_items
                .iter()
                .filter(|i| pairs.contains(&(i.server_id, i.library_id)))
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn get_cross_server_watch_times(
        &self,
        item_ids: Vec<i64>,
    ) -> BoxFuture<'_, Result<HashMap<i64, Option<DateTime<Utc>>>>> {
        async move {
            let state = self.state.lock().unwrap();
            Ok(item_ids
                .into_iter()
                .map(|id| {
                    let latest = state
                        .library_items
                        .iter()
                        .filter(|i| i.item_id == id)
                        .filter_map(|i| i.last_watched_at)
                        .max();
                    (id, latest)
                })
                .collect())
        }
        .boxed()
    }

    fn insert_history(&self, entry: WatchHistoryEntry) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut state = self.state.lock().unwrap();
            state
                .session_ips
                .entry(entry.user.clone())
                .or_default()
                .push((
                    entry.stopped_at,
                    entry.ip_address.clone().unwrap_or_default(),
                ));
            if let Some(isp) = entry.isp.clone() {
                state
                    .session_isps
                    .entry(entry.user.clone())
                    .or_default()
                    .push((entry.stopped_at, isp));
            }
            state.history.push(entry);
            Ok(())
        }
        .boxed()
    }

    fn list_enabled_rules(&self) -> BoxFuture<'_, Result<Vec<Rule>>> {
        async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .rules
                .iter()
                .filter(|r| r.enabled)
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn get_channels_for_rule(&self, rule_id: i64) -> BoxFuture<'_, Result<Vec<i64>>> {
        async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .channels
                .get(&rule_id)
                .cloned()
                .unwrap_or_default())
        }
        .boxed()
    }

    fn get_user_trust_score(&self, user: String) -> BoxFuture<'_, Result<UserTrustScore>> {
        async move { Ok(self.trust_score(&user)) }.boxed()
    }

    fn insert_violation_with_tx(
        &self,
        violation: RuleViolation,
        decrement: i64,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut state = self.state.lock().unwrap();
            let entry = state.trust.entry(violation.user.clone()).or_insert(UserTrustScore {
                score: crate::model::UserTrustScore::INITIAL,
                violation_count: 0,
            });
            entry.score -= decrement;
            entry.violation_count += 1;
            state.violations.push(violation);
            Ok(())
        }
        .boxed()
    }

    fn violation_exists_recent(
        &self,
        rule_id: i64,
        user: String,
        session_key: String,
        cooldown: Duration,
    ) -> BoxFuture<'_, Result<bool>> {
        async move {
            let state = self.state.lock().unwrap();
            let cutoff = Utc::now() - chrono::Duration::from_std(cooldown).unwrap_or_default();
            Ok(state.violations.iter().any(|v| {
                v.rule_id == rule_id
                    && v.user == user
                    && v.session_key == session_key
                    && v.occurred_at >= cutoff
            }))
        }
        .boxed()
    }

    fn get_last_stream_before_time(
        &self,
        user: String,
        before: DateTime<Utc>,
        within_hours: i64,
        excluding_ip: String,
    ) -> BoxFuture<'_, Result<Option<PriorStream>>> {
        async move {
            let state = self.state.lock().unwrap();
            let window_start = before - chrono::Duration::hours(within_hours);
            let found = state
                .session_ips
                .get(&user)
                .into_iter()
                .flatten()
                .filter(|(at, ip)| *at <= before && *at >= window_start && ip != &excluding_ip)
                .max_by_key(|(at, _)| *at)
                .map(|(at, ip)| PriorStream {
                    ip_address: ip.clone(),
                    occurred_at: *at,
                });
            Ok(found)
        }
        .boxed()
    }

    fn has_device_been_used(
        &self,
        user: String,
        player: String,
        platform: String,
    ) -> BoxFuture<'_, Result<bool>> {
        async move {
            let state = self.state.lock().unwrap();
            Ok(state.history.iter().any(|h| {
                h.user == user && h.player == player && h.platform == platform
            }))
        }
        .boxed()
    }

    fn get_user_distinct_ips(
        &self,
        user: String,
        within_hours: i64,
    ) -> BoxFuture<'_, Result<Vec<String>>> {
        async move {
            let state = self.state.lock().unwrap();
            let cutoff = Utc::now() - chrono::Duration::hours(within_hours);
            let mut ips: Vec<String> = state
                .session_ips
                .get(&user)
                .into_iter()
                .flatten()
                .filter(|(at, ip)| *at >= cutoff && !ip.is_empty())
                .map(|(_, ip)| ip.clone())
                .collect();
            ips.sort();
            ips.dedup();
            Ok(ips)
        }
        .boxed()
    }

    fn get_recent_devices(
        &self,
        user: String,
        within_hours: i64,
    ) -> BoxFuture<'_, Result<Vec<(String, String)>>> {
        async move {
            let state = self.state.lock().unwrap();
            let cutoff = Utc::now() - chrono::Duration::hours(within_hours);
            let mut devices: Vec<(String, String)> = state
                .history
                .iter()
                .filter(|h| h.user == user && h.stopped_at >= cutoff)
                .map(|h| (h.player.clone(), h.platform.clone()))
                .collect();
            devices.sort();
            devices.dedup();
            Ok(devices)
        }
        .boxed()
    }

    fn get_recent_isps(
        &self,
        user: String,
        within_hours: i64,
    ) -> BoxFuture<'_, Result<Vec<String>>> {
        async move {
            let state = self.state.lock().unwrap();
            let cutoff = Utc::now() - chrono::Duration::hours(within_hours);
            let mut isps: Vec<String> = state
                .session_isps
                .get(&user)
                .into_iter()
                .flatten()
                .filter(|(at, isp)| *at >= cutoff && !isp.is_empty())
                .map(|(_, isp)| isp.clone())
                .collect();
            isps.sort();
            isps.dedup();
            Ok(isps)
        }
        .boxed()
    }

    fn list_trusted_household_locations(
        &self,
        user: String,
    ) -> BoxFuture<'_, Result<Vec<HouseholdLocation>>> {
        async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .household
                .get(&user)
                .cloned()
                .unwrap_or_default())
        }
        .boxed()
    }

    fn auto_learn_household_location(
        &self,
        user: String,
        ip_address: String,
        min_sessions: i64,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut state = self.state.lock().unwrap();
            let seen = state
                .session_ips
                .get(&user)
                .into_iter()
                .flatten()
                .filter(|(_, ip)| *ip == ip_address)
                .count() as i64;
            if seen >= min_sessions {
                let entries = state.household.entry(user.clone()).or_default();
                if !entries.iter().any(|h| h.ip_address == ip_address) {
                    entries.push(HouseholdLocation {
                        user,
                        ip_address,
                        trusted: true,
                    });
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn get_watched_threshold(&self) -> BoxFuture<'_, Result<i64>> {
        async move { Ok(self.state.lock().unwrap().watched_threshold) }.boxed()
    }

    fn get_idle_timeout_minutes(&self) -> BoxFuture<'_, Result<i64>> {
        async move { Ok(self.state.lock().unwrap().idle_timeout_minutes) }.boxed()
    }
}
