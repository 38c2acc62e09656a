//! Overseerr REST client (spec §4.7, §6): look up cached media by TMDB
//! id, delete its outstanding request (if any), and clear its media
//! data. Construction mirrors the companion Radarr/Sonarr clients, but
//! auth uses the `X-Api-Key` header Overseerr documents for its own API.

use anyhow::{Result, anyhow};
use reqwest::{
    Url,
    header::{HeaderMap, HeaderValue},
};
use rustls_platform_verifier::ConfigVerifierExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{instrument, warn};

#[derive(Clone)]
pub struct Client {
    base_url: Url,
    client: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let mut api_key = HeaderValue::from_str(api_key)?;
        api_key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", api_key);
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .use_preconfigured_tls(rustls::ClientConfig::with_platform_verifier())
            .build()?;

        Ok(Self {
            base_url: base_url.parse()?,
            client,
        })
    }

    async fn get<Out: DeserializeOwned, Param: Serialize + ?Sized>(
        &self,
        path: &str,
        params: Option<&Param>,
    ) -> Result<Out> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url is relative"))?
            .push("api")
            .push("v1")
            .extend(path.split('/'));
        let get = self.client.get(url);
        let get = if let Some(params) = params {
            get.query(params)
        } else {
            get
        };
        let response = get.send().await?.error_for_status()?;
        Ok(response.json::<Out>().await?)
    }

    #[instrument(skip(self))]
    pub async fn find_movie_by_tmdb_id(&self, tmdb_id: i64) -> Result<Option<MediaResource>> {
        let media = self
            .get::<Value, ()>(&format!("movie/{tmdb_id}"), None)
            .await?;
        Ok(media.get("mediaInfo").and_then(|v| {
            serde_json::from_value::<MediaResource>(v.clone()).ok()
        }))
    }

    /// Deletes the outstanding request if one exists, then clears the
    /// media entry. A failure deleting the media entry after the request
    /// has already been removed is logged and still reported as success
    /// (spec §4.7).
    #[instrument(skip(self))]
    pub async fn delete_request_and_media(&self, media: &MediaResource) -> Result<()> {
        if let Some(request_id) = media.request_id {
            self.delete(&format!("request/{request_id}")).await?;
        }

        if let Err(err) = self.delete(&format!("media/{}", media.id)).await {
            warn!(media_id = media.id, "clearing overseerr media data failed: {err:#}");
        }

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url is relative"))?
            .push("api")
            .push("v1")
            .extend(path.split('/'));
        self.client.delete(url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaResource {
    pub id: i64,
    pub request_id: Option<i64>,
    #[serde(flatten)]
    other: serde_json::Value,
}

#[cfg(test)]
mod test {
    use httpmock::Method::{DELETE, GET};
    use serde_json::json;

    #[tokio::test]
    async fn find_movie_returns_media_info() -> anyhow::Result<()> {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/api/v1/movie/27205").method(GET);
                then.json_body(json!({
                    "id": 27205,
                    "mediaInfo": { "id": 9, "requestId": 3 }
                }));
            })
            .await;

        let client = super::Client::new(&server.base_url(), "secret")?;
        let media = client.find_movie_by_tmdb_id(27205).await?.unwrap();
        assert_eq!(media.id, 9);
        assert_eq!(media.request_id, Some(3));

        mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_media_info_is_none() -> anyhow::Result<()> {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/api/v1/movie/1").method(GET);
                then.json_body(json!({ "id": 1 }));
            })
            .await;

        let client = super::Client::new(&server.base_url(), "secret")?;
        assert!(client.find_movie_by_tmdb_id(1).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn deletes_request_then_media() -> anyhow::Result<()> {
        let server = httpmock::MockServer::start_async().await;
        let request_mock = server
            .mock_async(|when, then| {
                when.path("/api/v1/request/3").method(DELETE);
                then.status(200);
            })
            .await;
        let media_mock = server
            .mock_async(|when, then| {
                when.path("/api/v1/media/9").method(DELETE);
                then.status(200);
            })
            .await;

        let client = super::Client::new(&server.base_url(), "secret")?;
        let media = super::MediaResource {
            id: 9,
            request_id: Some(3),
            other: json!({}),
        };
        client.delete_request_and_media(&media).await?;

        request_mock.assert_async().await;
        media_mock.assert_async().await;
        Ok(())
    }
}
