//! Pure tick reconciliation logic (spec §4.2). Kept free of I/O and
//! locking so the whole algorithm is unit-testable without a media
//! adapter or a clock: `reconcile` takes a snapshot of the old state plus
//! this tick's observations and returns the new state plus whatever must
//! be persisted to history.

use std::{collections::HashMap, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::model::{ActiveStream, PlaybackState, SessionKey, SessionMap};

/// One server's result for this tick: either the sessions it reported, or
/// a marker that the call to `get_sessions` failed.
pub enum ServerObservation {
    Ok(Vec<ActiveStream>),
    Failed,
}

pub struct TickInputs<'a> {
    pub old_sessions: &'a SessionMap,
    pub old_pending_dlna: &'a SessionMap,
    pub observations: &'a HashMap<i64, ServerObservation>,
    pub now: DateTime<Utc>,
    pub idle_timeout: Option<StdDuration>,
    pub stale_after: Duration,
}

pub struct TickOutcome {
    pub sessions: SessionMap,
    pub pending_dlna: SessionMap,
    /// Streams to persist as history, each with the `stopped_at` the spec
    /// requires for that termination reason (natural end, autoplay split,
    /// idle timeout, or stale failed-server expiry all use different
    /// timestamps).
    pub to_persist: Vec<(ActiveStream, DateTime<Utc>)>,
}

pub fn reconcile(inputs: TickInputs<'_>) -> TickOutcome {
    let TickInputs {
        old_sessions,
        old_pending_dlna,
        observations,
        now,
        idle_timeout,
        stale_after,
    } = inputs;

    let mut sessions = SessionMap::new();
    let mut pending_dlna = SessionMap::new();
    let mut to_persist = Vec::new();
    let mut consumed_old: std::collections::HashSet<SessionKey> = std::collections::HashSet::new();

    for observation in observations.values() {
        let Some(observed) = (match observation {
            ServerObservation::Ok(streams) => Some(streams),
            ServerObservation::Failed => None,
        }) else {
            continue;
        };

        for stream in observed {
            let key = stream.key();

            if stream.is_dlna() {
                if let Some(old) = old_sessions.get(&key) {
                    consumed_old.insert(key.clone());
                    sessions.insert(key, continuation(old, stream.clone(), now));
                } else if let Some(pending) = old_pending_dlna.get(&key) {
                    sessions.insert(key, continuation(pending, stream.clone(), now));
                } else {
                    pending_dlna.insert(key, initialize_new(stream.clone(), now));
                }
                continue;
            }

            if let Some(old) = old_sessions.get(&key) {
                consumed_old.insert(key.clone());
                sessions.insert(key, continuation(old, stream.clone(), now));
                continue;
            }

            // Autoplay: an old entry shares this session's prefix but a
            // different item id. Persist the old item, start the new one.
            let prefix = key.prefix();
            let autoplay_predecessor = old_sessions.iter().find(|(old_key, _)| {
                old_key.server_id == prefix.server_id
                    && old_key.session_id == prefix.session_id
                    && old_key.item_id != key.item_id
            });
            if let Some((old_key, old_entry)) = autoplay_predecessor {
                consumed_old.insert(old_key.clone());
                to_persist.push((old_entry.clone(), old_entry.last_progress_change));
            }

            sessions.insert(key, initialize_new(stream.clone(), now));
        }
    }

    // Anything left in the old live map was not re-observed this tick.
    for (old_key, old_entry) in old_sessions {
        if consumed_old.contains(old_key) || sessions.contains_key(old_key) {
            continue;
        }

        let server_failed = matches!(
            observations.get(&old_key.server_id),
            Some(ServerObservation::Failed)
        );

        if server_failed {
            if old_entry.last_poll_seen > now - stale_after {
                sessions.insert(old_key.clone(), old_entry.clone());
            } else {
                to_persist.push((old_entry.clone(), old_entry.last_poll_seen));
            }
        } else {
            to_persist.push((old_entry.clone(), now));
        }
    }

    // Idle timeout: paused sessions are exempt.
    if let Some(timeout) = idle_timeout.filter(|d| !d.is_zero()) {
        let timeout = Duration::from_std(timeout).unwrap_or(Duration::zero());
        let idle_keys: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, entry)| {
                entry.state != PlaybackState::Paused && now - entry.last_progress_change > timeout
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in idle_keys {
            if let Some(mut entry) = sessions.remove(&key) {
                entry.idle_stopped = true;
                let stopped_at = entry.last_progress_change;
                to_persist.push((entry, stopped_at));
            }
        }
    }

    TickOutcome {
        sessions,
        pending_dlna,
        to_persist,
    }
}

/// Merges a freshly observed stream into the session it continues,
/// preserving identity fields the adapter re-derives from scratch every
/// tick (spec §3: "`started_at` never rewritten by a later observation").
fn continuation(old: &ActiveStream, observed: ActiveStream, now: DateTime<Utc>) -> ActiveStream {
    let mut merged = observed;

    merged.started_at = old.started_at;
    merged.paused_ms = old.paused_ms;
    merged.last_paused_at = old.last_paused_at;

    apply_pause_transition(old.state, merged.state, now, &mut merged);

    merged.last_progress_change = if merged.progress_ms > old.progress_ms {
        now
    } else {
        old.last_progress_change
    };

    if old.transcode_key() != merged.transcode_key() {
        info!(
            session_id = %merged.session_id,
            old = ?old.transcode_key(),
            new = ?merged.transcode_key(),
            "transcode decision changed mid-stream"
        );
    }

    merged.last_poll_seen = now;
    merged
}

/// `updatePauseState` (spec §4.2).
fn apply_pause_transition(
    old_state: PlaybackState,
    new_state: PlaybackState,
    now: DateTime<Utc>,
    merged: &mut ActiveStream,
) {
    match (old_state, new_state) {
        (PlaybackState::Paused, PlaybackState::Paused) => {}
        (PlaybackState::Paused, _) => {
            if let Some(paused_at) = merged.last_paused_at {
                let elapsed = now.signed_duration_since(paused_at).num_milliseconds();
                if elapsed > 0 {
                    merged.paused_ms += elapsed;
                }
            }
            merged.last_paused_at = None;
        }
        (_, PlaybackState::Paused) => {
            merged.last_paused_at = Some(now);
        }
        _ => {}
    }
}

fn initialize_new(observed: ActiveStream, now: DateTime<Utc>) -> ActiveStream {
    let mut stream = observed;
    stream.last_progress_change = now;
    stream.last_poll_seen = now;
    stream.last_paused_at = (stream.state == PlaybackState::Paused).then_some(now);
    stream
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{MediaType, TranscodeDecision};
    use std::collections::HashMap as Map;

    fn base_stream(session_id: &str, item_id: &str, progress_ms: i64, duration_ms: i64) -> ActiveStream {
        ActiveStream {
            server_id: 1,
            session_id: session_id.into(),
            item_id: item_id.into(),
            user: "alice".into(),
            media_type: MediaType::Movie,
            title: "Title".into(),
            parent_title: None,
            grandparent_title: None,
            duration_ms,
            progress_ms,
            state: PlaybackState::Playing,
            player: "Player".into(),
            platform: "web".into(),
            ip_address: None,
            started_at: Utc::now(),
            last_progress_change: Utc::now(),
            last_paused_at: None,
            paused_ms: 0,
            video_codec: None,
            audio_codec: None,
            resolution: None,
            bandwidth_kbps: None,
            video_decision: TranscodeDecision::DirectPlay,
            audio_decision: TranscodeDecision::DirectPlay,
            last_poll_seen: Utc::now(),
            idle_stopped: false,
        }
    }

    fn observations(server_id: i64, streams: Vec<ActiveStream>) -> Map<i64, ServerObservation> {
        let mut map = Map::new();
        map.insert(server_id, ServerObservation::Ok(streams));
        map
    }

    #[test]
    fn happy_path_termination_on_disappearance() {
        let now = Utc::now();
        let stream = base_stream("s1", "100", 50_000, 100_000);
        let key = stream.key();

        let mut old = SessionMap::new();
        old.insert(key.clone(), stream);

        let outcome = reconcile(TickInputs {
            old_sessions: &old,
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert!(outcome.sessions.is_empty());
        assert_eq!(outcome.to_persist.len(), 1);
        assert_eq!(outcome.to_persist[0].0.progress_ms, 50_000);
    }

    #[test]
    fn continuation_preserves_started_at() {
        let now = Utc::now();
        let original_start = now - Duration::minutes(10);
        let mut stream = base_stream("s1", "100", 10_000, 100_000);
        stream.started_at = original_start;
        let key = stream.key();

        let mut old = SessionMap::new();
        old.insert(key.clone(), stream);

        let mut next = base_stream("s1", "100", 20_000, 100_000);
        next.started_at = now;

        let outcome = reconcile(TickInputs {
            old_sessions: &old,
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![next]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert_eq!(outcome.sessions[&key].started_at, original_start);
        assert!(outcome.to_persist.is_empty());
    }

    #[test]
    fn autoplay_splits_into_history_row() {
        let now = Utc::now();
        let ep1 = base_stream("s1", "100", 90_000, 100_000);
        let old_key = ep1.key();

        let mut old = SessionMap::new();
        old.insert(old_key, ep1);

        let ep2 = base_stream("s1", "200", 0, 120_000);

        let outcome = reconcile(TickInputs {
            old_sessions: &old,
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![ep2.clone()]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert_eq!(outcome.sessions.len(), 1);
        assert_eq!(outcome.to_persist.len(), 1);
        assert_eq!(outcome.to_persist[0].0.item_id, "100");
        assert!(outcome.sessions.contains_key(&ep2.key()));
    }

    #[test]
    fn dlna_requires_two_ticks_before_promotion() {
        let now = Utc::now();
        let mut dlna = base_stream("s1", "100", 0, 100_000);
        dlna.platform = "DLNA".into();

        let outcome = reconcile(TickInputs {
            old_sessions: &SessionMap::new(),
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![dlna.clone()]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert!(outcome.sessions.is_empty());
        assert_eq!(outcome.pending_dlna.len(), 1);

        let outcome2 = reconcile(TickInputs {
            old_sessions: &outcome.sessions,
            old_pending_dlna: &outcome.pending_dlna,
            observations: &observations(1, vec![dlna.clone()]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert_eq!(outcome2.sessions.len(), 1);
        assert!(outcome2.pending_dlna.is_empty());
    }

    #[test]
    fn dlna_dropped_if_not_reseen() {
        let now = Utc::now();
        let mut dlna = base_stream("s1", "100", 0, 100_000);
        dlna.platform = "DLNA".into();

        let first = reconcile(TickInputs {
            old_sessions: &SessionMap::new(),
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![dlna]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        let second = reconcile(TickInputs {
            old_sessions: &first.sessions,
            old_pending_dlna: &first.pending_dlna,
            observations: &observations(1, vec![]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert!(second.sessions.is_empty());
        assert!(second.pending_dlna.is_empty());
        assert!(second.to_persist.is_empty());
    }

    #[test]
    fn transient_failure_carries_session_forward() {
        let now = Utc::now();
        let mut stream = base_stream("s1", "100", 10_000, 100_000);
        stream.last_poll_seen = now;
        let key = stream.key();

        let mut old = SessionMap::new();
        old.insert(key.clone(), stream);

        let mut failed = Map::new();
        failed.insert(1, ServerObservation::Failed);

        let outcome = reconcile(TickInputs {
            old_sessions: &old,
            old_pending_dlna: &SessionMap::new(),
            observations: &failed,
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert_eq!(outcome.sessions.len(), 1);
        assert!(outcome.to_persist.is_empty());
    }

    #[test]
    fn stale_failed_session_is_dropped_and_persisted() {
        let now = Utc::now();
        let mut stream = base_stream("s1", "100", 10_000, 100_000);
        stream.last_poll_seen = now - Duration::minutes(10);
        let key = stream.key();

        let mut old = SessionMap::new();
        old.insert(key, stream);

        let mut failed = Map::new();
        failed.insert(1, ServerObservation::Failed);

        let outcome = reconcile(TickInputs {
            old_sessions: &old,
            old_pending_dlna: &SessionMap::new(),
            observations: &failed,
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        assert!(outcome.sessions.is_empty());
        assert_eq!(outcome.to_persist.len(), 1);
    }

    #[test]
    fn idle_timeout_removes_non_paused_session() {
        let now = Utc::now();
        let mut stream = base_stream("s1", "100", 10_000, 100_000);
        stream.last_progress_change = now - Duration::minutes(31);

        let outcome = reconcile(TickInputs {
            old_sessions: &SessionMap::new(),
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![stream]),
            now,
            idle_timeout: Some(std::time::Duration::from_secs(30 * 60)),
            stale_after: Duration::minutes(5),
        });

        assert!(outcome.sessions.is_empty());
        assert_eq!(outcome.to_persist.len(), 1);
        assert!(outcome.to_persist[0].0.idle_stopped);
    }

    #[test]
    fn idle_timeout_exempts_paused_sessions() {
        let now = Utc::now();
        let mut stream = base_stream("s1", "100", 10_000, 100_000);
        stream.state = PlaybackState::Paused;
        stream.last_progress_change = now - Duration::minutes(31);

        let outcome = reconcile(TickInputs {
            old_sessions: &SessionMap::new(),
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![stream]),
            now,
            idle_timeout: Some(std::time::Duration::from_secs(30 * 60)),
            stale_after: Duration::minutes(5),
        });

        assert_eq!(outcome.sessions.len(), 1);
        assert!(outcome.to_persist.is_empty());
    }

    #[test]
    fn pause_then_resume_accumulates_paused_ms() {
        let now = Utc::now();
        let mut stream = base_stream("s1", "100", 10_000, 100_000);
        stream.state = PlaybackState::Paused;
        stream.last_paused_at = Some(now - Duration::seconds(20));
        let key = stream.key();

        let mut old = SessionMap::new();
        old.insert(key.clone(), stream);

        let mut resumed = base_stream("s1", "100", 10_000, 100_000);
        resumed.state = PlaybackState::Playing;

        let outcome = reconcile(TickInputs {
            old_sessions: &old,
            old_pending_dlna: &SessionMap::new(),
            observations: &observations(1, vec![resumed]),
            now,
            idle_timeout: None,
            stale_after: Duration::minutes(5),
        });

        let merged = &outcome.sessions[&key];
        assert!(merged.paused_ms >= 19_000);
        assert!(merged.last_paused_at.is_none());
    }
}
