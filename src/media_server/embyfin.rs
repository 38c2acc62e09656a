//! Shared adapter for Emby and Jellyfin, which expose the same
//! `/Sessions` shape modulo the auth header and a couple of field names
//! (spec §4.1). `Fork` picks the one that differs.

use anyhow::{Result, anyhow};
use chrono::Utc;
use futures::{FutureExt, future::BoxFuture};
use reqwest::header::{HeaderMap, HeaderValue};
use rustls_platform_verifier::ConfigVerifierExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::model::{ActiveStream, MediaType, PlaybackState, ServerKind};

use super::parse_transcode_decision;

/// Emby and Jellyfin diverged from a shared codebase; this is the one
/// axis (auth header, reported server kind) where they still differ.
#[derive(Clone, Copy, Debug)]
pub enum Fork {
    Jellyfin,
    Emby,
}

pub struct Client {
    name: String,
    server_id: i64,
    fork: Fork,
    http: reqwest::Client,
    url: reqwest::Url,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        server_id: i64,
        url: &str,
        api_key: &str,
        fork: Fork,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        match fork {
            Fork::Jellyfin => {
                let value = format!("MediaBrowser Token=\"{api_key}\"");
                let mut value = HeaderValue::from_str(&value)?;
                value.set_sensitive(true);
                headers.insert("Authorization", value);
            }
            Fork::Emby => {
                let mut token = HeaderValue::from_str(api_key)?;
                token.set_sensitive(true);
                headers.insert("X-Emby-Token", token);
            }
        }
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .use_preconfigured_tls(rustls::ClientConfig::with_platform_verifier())
            .build()?;

        let url = url.parse()?;

        Ok(Self {
            name: name.into(),
            server_id,
            fork,
            http,
            url,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url is relative"))?
            .extend(path.split('/'));
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn sessions_json(&self) -> Result<Vec<Value>> {
        self.get("Sessions").await
    }

    fn kind(&self) -> ServerKind {
        match self.fork {
            Fork::Jellyfin => ServerKind::Jellyfin,
            Fork::Emby => ServerKind::Emby,
        }
    }
}

/// Emby/Jellyfin report durations and offsets in 100ns ticks.
fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / 10_000
}

fn extract(raw: &Value, server_id: i64) -> Option<ActiveStream> {
    let item = raw.get("NowPlayingItem")?;
    let media_type = match item.get("Type").and_then(Value::as_str)? {
        "Movie" => MediaType::Movie,
        "Episode" => MediaType::Episode,
        "Audio" => MediaType::Track,
        "TvChannel" | "LiveTvChannel" => MediaType::LiveTv,
        _ => return None,
    };

    let session_id = raw.get("Id").and_then(Value::as_str)?.to_string();
    let item_id = item.get("Id").and_then(Value::as_str)?.to_string();
    let title = item.get("Name").and_then(Value::as_str)?.to_string();
    let user = raw
        .get("UserName")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let duration_ms = item
        .get("RunTimeTicks")
        .and_then(Value::as_i64)
        .map(ticks_to_ms)
        .unwrap_or(0);

    let play_state = raw.get("PlayState").cloned().unwrap_or(Value::Null);
    let progress_ms = play_state
        .get("PositionTicks")
        .and_then(Value::as_i64)
        .map(ticks_to_ms)
        .unwrap_or(0);

    let state = match (
        play_state.get("IsPaused").and_then(Value::as_bool),
        play_state.get("IsBuffering").and_then(Value::as_bool),
    ) {
        (_, Some(true)) => PlaybackState::Buffering,
        (Some(true), _) => PlaybackState::Paused,
        (Some(false), _) => PlaybackState::Playing,
        _ => PlaybackState::Stopped,
    };

    let player = raw
        .get("Client")
        .and_then(Value::as_str)
        .unwrap_or("Unknown Client")
        .to_string();
    let platform = raw
        .get("DeviceName")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let ip_address = raw
        .get("RemoteEndPoint")
        .and_then(Value::as_str)
        .map(str::to_string);

    let transcoding = raw.get("TranscodingInfo").cloned();
    let bandwidth_kbps = transcoding
        .as_ref()
        .and_then(|t| t.get("Bitrate"))
        .and_then(Value::as_i64)
        .map(|bps| bps / 1000);
    let video_codec = transcoding
        .as_ref()
        .and_then(|t| t.get("VideoCodec"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let audio_codec = transcoding
        .as_ref()
        .and_then(|t| t.get("AudioCodec"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let resolution = transcoding
        .as_ref()
        .and_then(|t| t.get("Height"))
        .and_then(Value::as_i64)
        .map(|h| h.to_string());

    let play_method = play_state.get("PlayMethod").and_then(Value::as_str);
    let (video_decision, audio_decision) = match play_method {
        Some("Transcode") => {
            let v = parse_transcode_decision(Some("transcode"));
            (v, v)
        }
        Some("DirectStream") => {
            let v = parse_transcode_decision(Some("directstream"));
            (v, v)
        }
        _ => (
            parse_transcode_decision(None),
            parse_transcode_decision(None),
        ),
    };

    let now = Utc::now();

    Some(ActiveStream {
        server_id,
        session_id,
        item_id,
        user,
        media_type,
        title,
        parent_title: item
            .get("SeasonName")
            .and_then(Value::as_str)
            .map(str::to_string),
        grandparent_title: item
            .get("SeriesName")
            .and_then(Value::as_str)
            .map(str::to_string),
        duration_ms,
        progress_ms,
        state,
        player,
        platform,
        ip_address,
        started_at: now,
        last_progress_change: now,
        last_paused_at: None,
        paused_ms: 0,
        video_codec,
        audio_codec,
        resolution,
        bandwidth_kbps,
        video_decision,
        audio_decision,
        last_poll_seen: now,
        idle_stopped: false,
    })
}

impl super::Client for Client {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ServerKind {
        self.kind()
    }

    fn get_sessions(&self) -> BoxFuture<'_, Result<Vec<ActiveStream>>> {
        async move {
            let raw = self.sessions_json().await?;
            Ok(raw
                .iter()
                .filter_map(|r| {
                    let stream = extract(r, self.server_id);
                    if stream.is_none() {
                        debug!(session = ?r, "skipping unparseable Emby/Jellyfin session");
                    }
                    stream
                })
                .collect())
        }
        .boxed()
    }

    fn test_connection(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.get::<Value>("System/Info").await?;
            Ok(())
        }
        .boxed()
    }
}
