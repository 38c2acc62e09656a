//! Core entities shared across the poller, rules engine, and maintenance
//! pipeline. Field shapes follow the data model rather than any single
//! media server's wire format; adapters are responsible for normalizing
//! into these types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Plex,
    Emby,
    Jellyfin,
}

#[derive(Clone, Debug)]
pub struct Server {
    pub id: i64,
    pub kind: ServerKind,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub deleted: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
    LiveTv,
    Track,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Buffering,
    Stopped,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranscodeDecision {
    DirectPlay,
    DirectStream,
    Transcode,
}

impl Default for TranscodeDecision {
    fn default() -> Self {
        Self::DirectPlay
    }
}

/// Composite identity of a single playback of a single item.
///
/// The prefix `(server_id, session_id)` identifies the underlying player
/// session across item changes (autoplay); the full key identifies one
/// item's play within that session.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionKey {
    pub server_id: i64,
    pub session_id: String,
    pub item_id: String,
}

impl SessionKey {
    pub fn prefix(&self) -> SessionPrefix {
        SessionPrefix {
            server_id: self.server_id,
            session_id: self.session_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SessionPrefix {
    pub server_id: i64,
    pub session_id: String,
}

#[derive(Clone, Debug)]
pub struct ActiveStream {
    pub server_id: i64,
    pub session_id: String,
    pub item_id: String,
    pub user: String,
    pub media_type: MediaType,
    pub title: String,
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    pub duration_ms: i64,
    pub progress_ms: i64,
    pub state: PlaybackState,
    pub player: String,
    pub platform: String,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_progress_change: DateTime<Utc>,
    pub last_paused_at: Option<DateTime<Utc>>,
    pub paused_ms: i64,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<String>,
    pub bandwidth_kbps: Option<i64>,
    pub video_decision: TranscodeDecision,
    pub audio_decision: TranscodeDecision,
    pub last_poll_seen: DateTime<Utc>,
    pub idle_stopped: bool,
}

impl ActiveStream {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            server_id: self.server_id,
            session_id: self.session_id.clone(),
            item_id: self.item_id.clone(),
        }
    }

    pub fn transcode_key(&self) -> (TranscodeDecision, TranscodeDecision) {
        (self.video_decision, self.audio_decision)
    }

    pub fn is_dlna(&self) -> bool {
        self.platform.eq_ignore_ascii_case("dlna") || self.player.eq_ignore_ascii_case("dlna")
    }
}

/// A push-delivered update for an already-known (or about to be known)
/// session. Adapters that support realtime notifications translate their
/// native event into this shape.
#[derive(Clone, Debug)]
pub struct SessionUpdate {
    pub server_id: i64,
    pub session_id: String,
    pub state: PlaybackState,
    pub view_offset_ms: i64,
    pub rating_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct WatchHistoryEntry {
    pub server_id: i64,
    pub session_id: String,
    pub item_id: String,
    pub user: String,
    pub media_type: MediaType,
    pub title: String,
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    pub duration_ms: i64,
    pub watched_ms: i64,
    pub watched: bool,
    pub player: String,
    pub platform: String,
    pub ip_address: Option<String>,
    pub isp: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub paused_ms: i64,
    pub video_decision: TranscodeDecision,
    pub audio_decision: TranscodeDecision,
}

impl From<ActiveStream> for WatchHistoryEntryBuilder {
    fn from(stream: ActiveStream) -> Self {
        WatchHistoryEntryBuilder { stream, isp: None }
    }
}

/// Finishes an [`ActiveStream`] into a [`WatchHistoryEntry`], applying the
/// watched-threshold and final-pause accounting rules in one place so every
/// call site (natural termination, autoplay split, idle timeout, failed
/// server expiry) goes through the same logic.
pub struct WatchHistoryEntryBuilder {
    stream: ActiveStream,
    isp: Option<String>,
}

impl WatchHistoryEntryBuilder {
    /// Attaches the ISP resolved for the stream's IP, if any (spec §4.5);
    /// the caller resolves it since geo lookups are the caller's concern.
    pub fn with_isp(mut self, isp: Option<String>) -> Self {
        self.isp = isp;
        self
    }

    /// `stopped_at` is explicit because idle-timeout terminations use the
    /// last progress change, not wall-clock now (spec §4.2, §8).
    pub fn finish(self, stopped_at: DateTime<Utc>, watched_threshold_percent: i64) -> WatchHistoryEntry {
        let isp = self.isp;
        let mut stream = self.stream;

        if let (PlaybackState::Paused, Some(paused_at)) = (stream.state, stream.last_paused_at) {
            let elapsed = stopped_at.signed_duration_since(paused_at).num_milliseconds();
            if elapsed > 0 {
                stream.paused_ms += elapsed;
            }
        }

        let watched_ms = watched_progress(stream.progress_ms, stream.duration_ms);
        let watched = is_watched(watched_ms, stream.duration_ms, watched_threshold_percent);

        WatchHistoryEntry {
            server_id: stream.server_id,
            session_id: stream.session_id,
            item_id: stream.item_id,
            user: stream.user,
            media_type: stream.media_type,
            title: stream.title,
            parent_title: stream.parent_title,
            grandparent_title: stream.grandparent_title,
            duration_ms: stream.duration_ms,
            watched_ms,
            watched,
            player: stream.player,
            platform: stream.platform,
            ip_address: stream.ip_address,
            isp,
            started_at: stream.started_at,
            stopped_at,
            paused_ms: stream.paused_ms,
            video_decision: stream.video_decision,
            audio_decision: stream.audio_decision,
        }
    }
}

/// Near-end completion window (spec §4.2, §"Near-end" in Glossary).
const NEAR_END_MS: i64 = 10_000;

/// Normalizes progress to full duration when within the near-end window.
fn watched_progress(progress_ms: i64, duration_ms: i64) -> i64 {
    if duration_ms > 0 && duration_ms - progress_ms <= NEAR_END_MS {
        duration_ms
    } else {
        progress_ms
    }
}

fn is_watched(progress_ms: i64, duration_ms: i64, threshold_percent: i64) -> bool {
    duration_ms > 0 && progress_ms.saturating_mul(100) >= duration_ms.saturating_mul(threshold_percent)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn default_decrement(self) -> i64 {
        match self {
            Severity::Critical => 20,
            Severity::Warning => 10,
            Severity::Info => 5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuleViolation {
    pub rule_id: i64,
    pub user: String,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub confidence: u8,
    pub occurred_at: DateTime<Utc>,
    pub session_key: String,
}

#[derive(Clone, Debug, Default)]
pub struct UserTrustScore {
    pub score: i64,
    pub violation_count: i64,
}

impl UserTrustScore {
    pub const INITIAL: i64 = 100;
}

#[derive(Clone, Debug)]
pub struct HouseholdLocation {
    pub user: String,
    pub ip_address: String,
    pub trusted: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaintenanceCriterion {
    UnwatchedMovie,
    UnwatchedTvNone,
    LowResolution,
    LargeFiles,
}

#[derive(Clone, Debug)]
pub struct MaintenanceRule {
    pub id: i64,
    pub name: String,
    pub criterion: MaintenanceCriterion,
    pub media_type: Option<MediaType>,
    pub libraries: Vec<(i64, i64)>,
    pub enabled: bool,
    pub days: i64,
    pub max_height: i32,
    pub min_size_gb: f64,
}

impl Default for MaintenanceRule {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            criterion: MaintenanceCriterion::UnwatchedMovie,
            media_type: None,
            libraries: Vec::new(),
            enabled: true,
            days: 365,
            max_height: 720,
            min_size_gb: 10.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExternalIds {
    pub tmdb: Option<i64>,
    pub tvdb: Option<i64>,
    pub imdb: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LibraryItemCache {
    pub server_id: i64,
    pub library_id: i64,
    pub item_id: i64,
    pub title: String,
    pub year: Option<i32>,
    pub added_at: DateTime<Utc>,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub episode_count: i32,
    pub resolution: Option<String>,
    pub file_size_bytes: i64,
    pub media_type: MediaType,
    pub external_ids: ExternalIds,
}

#[derive(Clone, Debug)]
pub struct MaintenanceCandidate {
    pub rule_id: i64,
    pub library_item_id: i64,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeService {
    Radarr,
    Sonarr,
    Overseerr,
}

#[derive(Clone, Debug)]
pub struct CascadeResult {
    pub service: CascadeService,
    pub success: bool,
    pub error: Option<String>,
}

/// Groups provider ids that cross-server history matching keys on (spec
/// §4.6: "merge any cross-server last-watched timestamps ... matched by
/// shared external id").
pub fn external_id_key(ids: &ExternalIds) -> Option<(&'static str, String)> {
    if let Some(tmdb) = ids.tmdb {
        return Some(("tmdb", tmdb.to_string()));
    }
    if let Some(tvdb) = ids.tvdb {
        return Some(("tvdb", tvdb.to_string()));
    }
    ids.imdb.clone().map(|imdb| ("imdb", imdb))
}

/// Snapshot-per-server map of live sessions, keyed by the full session key.
pub type SessionMap = HashMap<SessionKey, ActiveStream>;

#[cfg(test)]
mod test {
    use super::*;

    fn stream(progress_ms: i64, duration_ms: i64) -> ActiveStream {
        ActiveStream {
            server_id: 1,
            session_id: "s1".into(),
            item_id: "100".into(),
            user: "alice".into(),
            media_type: MediaType::Movie,
            title: "Movie".into(),
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

    #[test]
    fn watched_threshold_exact() {
        let entry = WatchHistoryEntryBuilder::from(stream(85_000, 100_000)).finish(Utc::now(), 85);
        assert!(entry.watched);
    }

    #[test]
    fn watched_threshold_just_under() {
        let entry = WatchHistoryEntryBuilder::from(stream(84_000, 100_000)).finish(Utc::now(), 85);
        assert!(!entry.watched);
    }

    #[test]
    fn near_end_completion_counts_as_watched() {
        let entry = WatchHistoryEntryBuilder::from(stream(91_000, 100_000)).finish(Utc::now(), 85);
        assert_eq!(entry.watched_ms, 100_000);
        assert!(entry.watched);
    }

    #[test]
    fn zero_duration_never_watched() {
        let entry = WatchHistoryEntryBuilder::from(stream(0, 0)).finish(Utc::now(), 85);
        assert!(!entry.watched);
    }

    #[test]
    fn final_pause_increment_applied() {
        let mut s = stream(50_000, 100_000);
        s.state = PlaybackState::Paused;
        let paused_at = Utc::now() - chrono::Duration::seconds(30);
        s.last_paused_at = Some(paused_at);
        let stopped_at = Utc::now();
        let entry = WatchHistoryEntryBuilder::from(s).finish(stopped_at, 85);
        assert!(entry.paused_ms >= 29_000);
    }
}
