//! Session reconciler (spec §4.2): owns the live session map and the
//! pending-DLNA map behind one RW lock, fans server snapshots through
//! [`reconcile`], and drives history persistence, subscriber fan-out, and
//! rule evaluation from the result.

pub mod reconcile;

use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use chrono::Duration;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    geo::GeoResolver,
    history::HistoryPersistor,
    media_server::Client as MediaClient,
    model::{ActiveStream, PlaybackState, SessionKey, SessionMap, SessionUpdate},
    repository::Repository,
    rules::RulesEngine,
    subscriber::{Registry, SubscriberHandle},
};

use reconcile::{ServerObservation, TickInputs, reconcile as run_tick};

/// "Transient upstream failure" carry-forward window (spec §4.2 step 4, §7).
const STALE_AFTER: Duration = Duration::minutes(5);

struct ServerEntry {
    client: Arc<dyn MediaClient>,
    push_cancel: Option<CancellationToken>,
}

struct State {
    servers: HashMap<i64, ServerEntry>,
    sessions: SessionMap,
    pending_dlna: SessionMap,
}

pub struct Poller {
    state: RwLock<State>,
    subscribers: Registry,
    history: Arc<HistoryPersistor>,
    rules_engine: Arc<RulesEngine>,
    repository: Arc<dyn Repository>,
    geo_resolver: Option<Arc<dyn GeoResolver>>,
    household_auto_learn_enabled: bool,
    household_min_sessions: i64,
    tick_interval: StdDuration,
    cancel: CancellationToken,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn Repository>,
        rules_engine: Arc<RulesEngine>,
        history: Arc<HistoryPersistor>,
        geo_resolver: Option<Arc<dyn GeoResolver>>,
        household_auto_learn_enabled: bool,
        household_min_sessions: i64,
        tick_interval: StdDuration,
    ) -> Self {
        Self {
            state: RwLock::new(State {
                servers: HashMap::new(),
                sessions: SessionMap::new(),
                pending_dlna: SessionMap::new(),
            }),
            subscribers: Registry::default(),
            history,
            rules_engine,
            repository,
            geo_resolver,
            household_auto_learn_enabled,
            household_min_sessions,
            tick_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a server; starts its push subscription if the adapter
    /// supports one (spec §9: "capability probe at registration time").
    /// Requires `Arc<Self>` because the push consumer task reaches back
    /// in to apply updates to the live session map.
    pub async fn add_server(self: &Arc<Self>, id: i64, client: Arc<dyn MediaClient>) {
        let push_cancel = if client.as_push().is_some() {
            Some(self.spawn_push_consumer(id, client.clone()))
        } else {
            None
        };

        self.state.write().await.servers.insert(id, ServerEntry { client, push_cancel });
    }

    /// Removes a server; every still-live session from it is persisted
    /// as terminated (spec §4.2, §9 open question (a): "persist-on-remove").
    pub async fn remove_server(&self, id: i64) {
        let removed: Vec<ActiveStream> = {
            let mut state = self.state.write().await;
            if let Some(entry) = state.servers.remove(&id) {
                if let Some(cancel) = entry.push_cancel {
                    cancel.cancel();
                }
            }
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sessions)
                .into_iter()
                .partition(|(key, _)| key.server_id == id);
            state.sessions = kept.into_iter().collect();
            removed.into_iter().map(|(_, stream)| stream).collect()
        };

        let threshold = self.repository.get_watched_threshold().await.unwrap_or(85);
        for stream in removed {
            self.persist(stream, chrono::Utc::now(), threshold).await;
        }
    }

    /// Spawns a detached task that reconnects/backs off inside `subscribe`
    /// (per [`crate::media_server::PushClient`]'s contract) and applies
    /// every yielded update until cancelled or the stream ends.
    fn spawn_push_consumer(self: &Arc<Self>, server_id: i64, client: Arc<dyn MediaClient>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let poller = self.clone();

        tokio::spawn(async move {
            let Some(push) = client.as_push() else { return };
            let mut updates = match push.subscribe().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(server_id, "push subscription failed: {err:#}");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = child.cancelled() => return,
                    update = updates.next() => {
                        match update {
                            Some(update) => poller.apply_push_update(update).await,
                            None => {
                                info!(server_id, "push stream ended");
                                return;
                            }
                        }
                    }
                }
            }
        });

        cancel
    }

    pub async fn current_sessions(&self) -> Vec<ActiveStream> {
        self.state.read().await.sessions.values().cloned().collect()
    }

    pub fn subscribe(&self) -> Arc<SubscriberHandle> {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&self, handle: &Arc<SubscriberHandle>) {
        self.subscribers.unsubscribe(handle);
    }

    /// Graceful shutdown step 3 (spec §9): every live session is written
    /// to history and the map cleared.
    pub async fn persist_active_sessions(&self) {
        let sessions: Vec<ActiveStream> = {
            let mut state = self.state.write().await;
            std::mem::take(&mut state.sessions).into_values().collect()
        };

        let threshold = self.repository.get_watched_threshold().await.unwrap_or(85);
        for stream in sessions {
            self.persist(stream, chrono::Utc::now(), threshold).await;
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs the tick loop until `stop()` is called. Intended to be driven
    /// from a long-lived task spawned by the caller
    /// (`tokio::spawn({ let poller = poller.clone(); async move { poller.run().await } })`).
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("poller tick loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!("tick failed: {err:#}");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now();

        let (server_snapshot, old_sessions, old_pending_dlna) = {
            let state = self.state.read().await;
            (
                state
                    .servers
                    .iter()
                    .map(|(id, entry)| (*id, entry.client.clone()))
                    .collect::<Vec<_>>(),
                state.sessions.clone(),
                state.pending_dlna.clone(),
            )
        };

        let mut observations = HashMap::new();
        for (server_id, client) in server_snapshot {
            match client.get_sessions().await {
                Ok(streams) => {
                    observations.insert(server_id, ServerObservation::Ok(streams));
                }
                Err(err) => {
                    warn!(server_id, "get_sessions failed this tick: {err:#}");
                    observations.insert(server_id, ServerObservation::Failed);
                }
            }
        }

        let idle_timeout_minutes = self.repository.get_idle_timeout_minutes().await?;
        let idle_timeout = (idle_timeout_minutes > 0)
            .then(|| StdDuration::from_secs((idle_timeout_minutes * 60) as u64));

        let outcome = run_tick(TickInputs {
            old_sessions: &old_sessions,
            old_pending_dlna: &old_pending_dlna,
            observations: &observations,
            now,
            idle_timeout,
            stale_after: STALE_AFTER,
        });

        {
            let mut state = self.state.write().await;
            state.sessions = outcome.sessions.clone();
            state.pending_dlna = outcome.pending_dlna;
        }

        let threshold = self.repository.get_watched_threshold().await.unwrap_or(85);
        for (stream, stopped_at) in outcome.to_persist {
            self.persist(stream, stopped_at, threshold).await;
        }

        self.history.drain_retries().await;

        let snapshot: Vec<ActiveStream> = outcome.sessions.into_values().collect();
        self.subscribers.publish(&snapshot);

        for stream in &snapshot {
            if let Err(err) = self
                .rules_engine
                .evaluate_session(stream.clone(), &snapshot)
                .await
            {
                error!(session_id = %stream.session_id, "rule evaluation pass failed: {err:#}");
            }
        }

        Ok(())
    }

    /// Applies a push-delivered update to the live session map (spec
    /// §4.2 "Push update handling"). Matched by `(server_id, session_id)`;
    /// a rating-key change splits the session (autoplay), a `stopped`
    /// state removes and persists it, anything else updates progress and
    /// pause-state bookkeeping in place.
    pub async fn apply_push_update(&self, update: SessionUpdate) {
        let stream_to_persist = {
            let mut state = self.state.write().await;
            let Some(key) = matching_key(&state.sessions, &update) else {
                return;
            };

            if matches!(update.state, PlaybackState::Stopped) {
                state.sessions.remove(&key)
            } else if update
                .rating_key
                .as_ref()
                .is_some_and(|rating_key| *rating_key != key.item_id)
            {
                state.sessions.remove(&key)
            } else {
                apply_progress_update(&mut state.sessions, &key, &update);
                None
            }
        };

        if let Some(stream) = stream_to_persist {
            let threshold = self.repository.get_watched_threshold().await.unwrap_or(85);
            self.persist(stream, chrono::Utc::now(), threshold).await;
        }
    }

    async fn persist(&self, stream: ActiveStream, stopped_at: chrono::DateTime<chrono::Utc>, threshold: i64) {
        let user = stream.user.clone();
        let ip = stream.ip_address.clone();

        let isp = match (&self.geo_resolver, ip.as_deref()) {
            (Some(resolver), Some(ip)) => resolver.lookup(ip).await.unwrap_or_else(|err| {
                warn!(%user, "geo lookup failed while persisting, ISP will not be recorded: {err:#}");
                None
            }),
            _ => None,
        }
        .map(|geo| geo.isp);

        let entry = crate::model::WatchHistoryEntryBuilder::from(stream)
            .with_isp(isp)
            .finish(stopped_at, threshold);
        self.history.insert(entry).await;

        if !self.household_auto_learn_enabled {
            return;
        }

        if let Some(ip) = ip {
            if let Err(err) = self
                .repository
                .auto_learn_household_location(user, ip, self.household_min_sessions)
                .await
            {
                warn!("household auto-learn failed: {err:#}");
            }
        }
    }
}

fn matching_key(sessions: &SessionMap, update: &SessionUpdate) -> Option<SessionKey> {
    sessions
        .keys()
        .find(|key| key.server_id == update.server_id && key.session_id == update.session_id)
        .cloned()
}

fn apply_progress_update(sessions: &mut SessionMap, key: &SessionKey, update: &SessionUpdate) {
    let Some(entry) = sessions.get_mut(key) else { return };
    let now = chrono::Utc::now();

    if update.view_offset_ms > entry.progress_ms {
        entry.last_progress_change = now;
    }

    let old_state = entry.state;
    entry.progress_ms = update.view_offset_ms;
    entry.state = update.state;

    match (old_state, update.state) {
        (PlaybackState::Paused, PlaybackState::Paused) => {}
        (PlaybackState::Paused, _) => {
            if let Some(paused_at) = entry.last_paused_at {
                let elapsed = now.signed_duration_since(paused_at).num_milliseconds();
                if elapsed > 0 {
                    entry.paused_ms += elapsed;
                }
            }
            entry.last_paused_at = None;
        }
        (_, PlaybackState::Paused) => {
            entry.last_paused_at = Some(now);
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{media_server::test_support::stream_default, repository::InMemoryRepository};
    use futures::{FutureExt, future::BoxFuture};

    struct FakeClient {
        streams: Vec<ActiveStream>,
    }

    impl MediaClient for FakeClient {
        fn name(&self) -> &str {
            "fake"
        }
        fn kind(&self) -> crate::model::ServerKind {
            crate::model::ServerKind::Plex
        }
        fn get_sessions(&self) -> BoxFuture<'_, anyhow::Result<Vec<ActiveStream>>> {
            let streams = self.streams.clone();
            async move { Ok(streams) }.boxed()
        }
        fn test_connection(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            async move { Ok(()) }.boxed()
        }
    }

    fn poller(repo: Arc<InMemoryRepository>) -> Arc<Poller> {
        poller_with_household(repo, true, 3)
    }

    fn poller_with_household(
        repo: Arc<InMemoryRepository>,
        household_auto_learn_enabled: bool,
        household_min_sessions: i64,
    ) -> Arc<Poller> {
        let engine = Arc::new(RulesEngine::new(
            repo.clone(),
            None,
            None,
            StdDuration::from_secs(300),
            StdDuration::from_secs(900),
        ));
        let history = Arc::new(HistoryPersistor::new(repo.clone()));
        Arc::new(Poller::new(
            repo,
            engine,
            history,
            None,
            household_auto_learn_enabled,
            household_min_sessions,
            StdDuration::from_millis(10),
        ))
    }

    #[tokio::test]
    async fn tick_promotes_and_then_terminates_session() {
        let repo = Arc::new(InMemoryRepository::default());
        let poller = poller(repo.clone());

        poller
            .add_server(1, Arc::new(FakeClient { streams: vec![stream_default()] }))
            .await;

        poller.tick().await.unwrap();
        assert_eq!(poller.current_sessions().await.len(), 1);

        {
            let mut state = poller.state.write().await;
            state.servers.get_mut(&1).unwrap().client = Arc::new(FakeClient { streams: vec![] });
        }

        poller.tick().await.unwrap();
        assert_eq!(poller.current_sessions().await.len(), 0);
        assert_eq!(repo.history().len(), 1);
    }

    #[tokio::test]
    async fn remove_server_persists_live_sessions() {
        let repo = Arc::new(InMemoryRepository::default());
        let poller = poller(repo.clone());

        poller
            .add_server(1, Arc::new(FakeClient { streams: vec![stream_default()] }))
            .await;
        poller.tick().await.unwrap();
        assert_eq!(poller.current_sessions().await.len(), 1);

        poller.remove_server(1).await;

        assert_eq!(poller.current_sessions().await.len(), 0);
        assert_eq!(repo.history().len(), 1);
    }

    #[tokio::test]
    async fn household_auto_learn_disabled_skips_learning() {
        let repo = Arc::new(InMemoryRepository::default());
        let poller = poller_with_household(repo.clone(), false, 1);

        let mut stream = stream_default();
        stream.ip_address = Some("10.0.0.5".into());
        poller.persist(stream, chrono::Utc::now(), 85).await;

        let locations = repo.list_trusted_household_locations("alice".into()).await.unwrap();
        assert!(locations.is_empty());
    }

    #[tokio::test]
    async fn household_auto_learn_respects_configured_min_sessions() {
        let repo = Arc::new(InMemoryRepository::default());
        let poller = poller_with_household(repo.clone(), true, 1);

        let mut stream = stream_default();
        stream.ip_address = Some("10.0.0.5".into());
        poller.persist(stream, chrono::Utc::now(), 85).await;

        let locations = repo.list_trusted_household_locations("alice".into()).await.unwrap();
        assert_eq!(locations.len(), 1);
    }
}
