//! Uniform view over Plex/Emby/Jellyfin session endpoints (spec §4.1).
//!
//! Each server kind gets its own `Client` that normalizes the
//! source-specific session shape into [`ActiveStream`]. Push support is a
//! separate, optional capability: the poller probes for it once at
//! registration time via [`Client::as_push`] rather than requiring every
//! adapter to implement a subscription it cannot offer.

pub mod embyfin;
pub mod plex;

use futures::{future::BoxFuture, stream::BoxStream};

use crate::model::{ActiveStream, ServerKind, SessionUpdate};

/// Polling capability every adapter must provide.
pub trait Client: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ServerKind;

    /// One-shot snapshot of currently-playing sessions, normalized into
    /// [`ActiveStream`]. Sessions the adapter cannot make sense of (missing
    /// fields, unsupported item types) are silently dropped rather than
    /// failing the whole call.
    fn get_sessions(&self) -> BoxFuture<'_, anyhow::Result<Vec<ActiveStream>>>;

    fn test_connection(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Capability probe for push support (spec §9, "duck-typed media
    /// server"). Adapters that support it override this; the default is
    /// poll-only.
    fn as_push(&self) -> Option<&dyn PushClient> {
        None
    }
}

/// Optional realtime push support. `subscribe` is expected to reconnect and
/// back off internally; the poller only consumes whatever the stream
/// yields and treats stream end as "no more push updates for this server".
pub trait PushClient: Client {
    fn subscribe(&self) -> BoxFuture<'_, anyhow::Result<BoxStream<'static, SessionUpdate>>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use crate::model::{ActiveStream, MediaType, PlaybackState, TranscodeDecision};

    pub fn stream_default() -> ActiveStream {
        ActiveStream {
            server_id: 1,
            session_id: "s1".into(),
            item_id: "100".into(),
            user: "alice".into(),
            media_type: MediaType::Movie,
            title: "Movie".into(),
            parent_title: None,
            grandparent_title: None,
            duration_ms: 0,
            progress_ms: 0,
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
}

/// Maps a source-specific transcode marker to the canonical decision.
/// Missing fields become `direct-play` (spec §4.1).
pub(crate) fn parse_transcode_decision(raw: Option<&str>) -> crate::model::TranscodeDecision {
    use crate::model::TranscodeDecision::{DirectPlay, DirectStream, Transcode};
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("transcode") => Transcode,
        Some("copy") | Some("directstream") | Some("direct stream") => DirectStream,
        _ => DirectPlay,
    }
}
