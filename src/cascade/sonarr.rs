//! Sonarr REST client (spec §4.7, §6): lookup a series by TVDB id, delete
//! it, and set monitoring to future-episodes-only after a partial delete.
//! Client construction mirrors the companion Radarr client.

use anyhow::{Result, anyhow};
use reqwest::{
    Url,
    header::{HeaderMap, HeaderValue},
};
use rustls_platform_verifier::ConfigVerifierExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, instrument};

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
    pub async fn find_by_tvdb_id(&self, tvdb_id: i64) -> Result<Option<SeriesResource>> {
        let series = self
            .get::<Vec<SeriesResource>, _>("series", Some(&[("tvdbId", tvdb_id)]))
            .await?;
        Ok(series.into_iter().next())
    }

    #[instrument(skip(self))]
    pub async fn delete_series(&self, series_id: i64) -> Result<()> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url is relative"))?
            .push("api")
            .push("v3")
            .push("series")
            .push(&series_id.to_string());
        self.client
            .delete(url)
            .query(&[("deleteFiles", "true")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Sets `monitorNewItems` to `none` and unmonitors every season, leaving
    /// already-downloaded episodes untouched (spec §4.7: "future episodes
    /// only" after a partial delete).
    #[instrument(skip(self))]
    pub async fn set_future_episodes_only(&self, series_id: i64) -> Result<()> {
        let mut series: SeriesResource = self
            .get::<Value, ()>(&format!("series/{series_id}"), None)
            .await
            .and_then(|v| serde_json::from_value(v).map_err(Into::into))?;

        series.monitor_new_items = Some(NewItemMonitorTypes::None);
        for season in &mut series.seasons {
            season.monitored = false;
        }

        self.put_series(&series).await?;
        debug!(series_id, "sonarr series set to future-episodes-only monitoring");
        Ok(())
    }

    async fn put_series(&self, series: &SeriesResource) -> Result<()> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("url is relative"))?
            .push("api")
            .push("v3")
            .push("series")
            .push(&series.id.to_string());
        self.client
            .put(url)
            .json(series)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonResource {
    pub season_number: i32,
    pub monitored: bool,
    #[serde(flatten)]
    other: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NewItemMonitorTypes {
    All,
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResource {
    pub id: i64,
    pub title: Option<String>,
    pub tvdb_id: i64,
    pub monitored: bool,
    pub monitor_new_items: Option<NewItemMonitorTypes>,
    pub seasons: Vec<SeasonResource>,
    #[serde(flatten)]
    other: serde_json::Value,
}
