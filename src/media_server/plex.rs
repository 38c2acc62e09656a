use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderValue};
use rustls_platform_verifier::ConfigVerifierExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::model::{ActiveStream, MediaType, PlaybackState, ServerKind};

use super::parse_transcode_decision;

pub struct Client {
    name: String,
    server_id: i64,
    http: reqwest::Client,
    url: reqwest::Url,
}

impl Client {
    pub fn new(name: impl Into<String>, server_id: i64, url: &str, token: &str) -> Result<Self> {
        let mut token = HeaderValue::from_str(token)?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("X-Plex-Token", token);
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
        let obj: serde_json::Map<String, Value> = self.get("status/sessions").await?;
        Ok(obj
            .get("MediaContainer")
            .and_then(|v| v.get("Metadata"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn extract(raw: &Value, server_id: i64) -> Option<ActiveStream> {
    let media_type = match raw.get("type")?.as_str()? {
        "movie" => MediaType::Movie,
        "episode" => MediaType::Episode,
        "track" => MediaType::Track,
        "clip" if raw.get("live").is_some() => MediaType::LiveTv,
        _ => return None,
    };

    let session_id = raw
        .get("Session")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)?
        .to_string();
    let item_id = raw.get("ratingKey")?.as_str()?.to_string();
    let title = raw.get("title")?.as_str()?.to_string();
    let user = raw
        .get("User")
        .and_then(|u| u.get("title"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let duration_ms = raw.get("duration").and_then(Value::as_i64).unwrap_or(0);
    let progress_ms = raw.get("viewOffset").and_then(Value::as_i64).unwrap_or(0);

    let player = raw.get("Player").cloned().unwrap_or(Value::Null);
    let state = match player.get("state").and_then(Value::as_str) {
        Some("playing") => PlaybackState::Playing,
        Some("paused") => PlaybackState::Paused,
        Some("buffering") => PlaybackState::Buffering,
        _ => PlaybackState::Stopped,
    };
    let player_title = player
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Plex Player")
        .to_string();
    let platform = player
        .get("platform")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let ip_address = player
        .get("address")
        .and_then(Value::as_str)
        .map(str::to_string);

    let media0 = raw
        .get("Media")
        .and_then(Value::as_array)
        .and_then(|a| a.first());
    let resolution = media0
        .and_then(|m| m.get("videoResolution"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let bandwidth_kbps = raw
        .get("Session")
        .and_then(|s| s.get("bandwidth"))
        .and_then(Value::as_i64);
    let video_codec = media0
        .and_then(|m| m.get("videoCodec"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let audio_codec = media0
        .and_then(|m| m.get("audioCodec"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let transcode = raw.get("TranscodeSession").cloned();
    let video_decision = parse_transcode_decision(
        transcode
            .as_ref()
            .and_then(|t| t.get("videoDecision"))
            .and_then(Value::as_str),
    );
    let audio_decision = parse_transcode_decision(
        transcode
            .as_ref()
            .and_then(|t| t.get("audioDecision"))
            .and_then(Value::as_str),
    );

    let now = Utc::now();

    Some(ActiveStream {
        server_id,
        session_id,
        item_id,
        user,
        media_type,
        title,
        parent_title: raw
            .get("parentTitle")
            .and_then(Value::as_str)
            .map(str::to_string),
        grandparent_title: raw
            .get("grandparentTitle")
            .and_then(Value::as_str)
            .map(str::to_string),
        duration_ms,
        progress_ms,
        state,
        player: player_title,
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
        ServerKind::Plex
    }

    fn get_sessions(&self) -> BoxFuture<'_, Result<Vec<ActiveStream>>> {
        async move {
            let raw = self.sessions_json().await?;
            Ok(raw
                .iter()
                .filter_map(|r| {
                    let stream = extract(r, self.server_id);
                    if stream.is_none() {
                        debug!(session = ?r, "skipping unparseable Plex session");
                    }
                    stream
                })
                .collect())
        }
        .boxed()
    }

    fn test_connection(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.get::<Value>("status/sessions").await?;
            Ok(())
        }
        .boxed()
    }
}
