//! Radarr REST client (spec §4.7, §6): lookup a movie by TMDB id and
//! delete it (and its files) from disk. Construction mirrors the
//! companion Sonarr client.

use anyhow::{Result, anyhow};
use reqwest::{
    Url,
    header::{HeaderMap, HeaderValue},
};
use rustls_platform_verifier::ConfigVerifierExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::instrument;

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
            .push("v3")
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
    pub async fn find_by_tmdb_id(&self, tmdb_id: i64) -> Result<Option<MovieResource>> {
        let movies = self
            .get::<Vec<MovieResource>, _>("movie", Some(&[("tmdbId", tmdb_id)]))
            .await?;
        Ok(movies.into_iter().next())
    }

    #[instrument(skip(self))]
    pub async fn delete_movie(&self, movie_id: i64) -> Result<()> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url is relative"))?
            .push("api")
            .push("v3")
            .push("movie")
            .push(&movie_id.to_string());
        self.client
            .delete(url)
            .query(&[("deleteFiles", "true"), ("addImportExclusion", "false")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieResource {
    pub id: i64,
    pub title: Option<String>,
    pub tmdb_id: i64,
    pub monitored: bool,
    #[serde(flatten)]
    other: serde_json::Value,
}

#[cfg(test)]
mod test {
    use httpmock::Method::{DELETE, GET};
    use serde_json::json;

    #[tokio::test]
    async fn find_by_tmdb_id_returns_first_match() -> anyhow::Result<()> {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/api/v3/movie").method(GET);
                then.json_body(json!([{
                    "id": 7,
                    "title": "Movie",
                    "tmdbId": 27205,
                    "monitored": true
                }]));
            })
            .await;

        let client = super::Client::new(&server.base_url(), "secret")?;
        let movie = client.find_by_tmdb_id(27205).await?.unwrap();
        assert_eq!(movie.id, 7);

        mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn not_found_returns_none() -> anyhow::Result<()> {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/api/v3/movie").method(GET);
                then.json_body(json!([]));
            })
            .await;

        let client = super::Client::new(&server.base_url(), "secret")?;
        assert!(client.find_by_tmdb_id(1).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_movie_hits_delete_endpoint() -> anyhow::Result<()> {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/api/v3/movie/7").method(DELETE);
                then.status(200);
            })
            .await;

        let client = super::Client::new(&server.base_url(), "secret")?;
        client.delete_movie(7).await?;

        mock.assert_async().await;
        Ok(())
    }
}
