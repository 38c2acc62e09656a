//! Cascade deleter (spec §4.7): for a library item, runs a fixed,
//! ordered task set — Radarr, Sonarr, Overseerr — concurrently, each
//! guarded by `cascade_timeout`. A task that cannot apply (wrong media
//! type, missing external id, integration not configured) is a no-op
//! reported as `success: false` with a logged reason, never an error.

pub mod overseerr;
pub mod radarr;
pub mod sonarr;

use std::time::Duration;

use tracing::{info, warn};

use crate::model::{CascadeResult, CascadeService, LibraryItemCache, MediaType};

pub const DEFAULT_CASCADE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct CascadeDeleter {
    radarr: Option<radarr::Client>,
    sonarr: Option<sonarr::Client>,
    overseerr: Option<overseerr::Client>,
    cascade_timeout: Duration,
}

impl CascadeDeleter {
    pub fn new(
        radarr: Option<radarr::Client>,
        sonarr: Option<sonarr::Client>,
        overseerr: Option<overseerr::Client>,
        cascade_timeout: Duration,
    ) -> Self {
        Self {
            radarr,
            sonarr,
            overseerr,
            cascade_timeout,
        }
    }

    pub async fn delete(&self, item: &LibraryItemCache) -> Vec<CascadeResult> {
        let (radarr, sonarr, overseerr) = tokio::join!(
            self.run(CascadeService::Radarr, self.delete_via_radarr(item)),
            self.run(CascadeService::Sonarr, self.delete_via_sonarr(item)),
            self.run(CascadeService::Overseerr, self.delete_via_overseerr(item)),
        );
        vec![radarr, sonarr, overseerr]
    }

    /// Sets Sonarr's series monitoring to future-episodes-only after a
    /// partial delete (spec §4.7), using the same timeout wrapper.
    pub async fn update_sonarr_monitoring(&self, item: &LibraryItemCache) -> CascadeResult {
        self.run(CascadeService::Sonarr, async {
            let Some(client) = &self.sonarr else {
                return no_op(CascadeService::Sonarr, "sonarr integration not configured");
            };
            let Some(tvdb_id) = item.external_ids.tvdb else {
                return no_op(CascadeService::Sonarr, "item has no tvdb id");
            };
            let series = match client.find_by_tvdb_id(tvdb_id).await {
                Ok(Some(series)) => series,
                Ok(None) => return no_op(CascadeService::Sonarr, "series not found in sonarr"),
                Err(err) => return failure(CascadeService::Sonarr, format!("{err:#}")),
            };
            match client.set_future_episodes_only(series.id).await {
                Ok(()) => success(CascadeService::Sonarr),
                Err(err) => failure(CascadeService::Sonarr, format!("{err:#}")),
            }
        })
        .await
    }

    async fn run(
        &self,
        service: CascadeService,
        task: impl std::future::Future<Output = CascadeResult>,
    ) -> CascadeResult {
        match tokio::time::timeout(self.cascade_timeout, task).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?service, "cascade task timed out");
                CascadeResult {
                    service,
                    success: false,
                    error: Some("timed out".to_string()),
                }
            }
        }
    }

    async fn delete_via_radarr(&self, item: &LibraryItemCache) -> CascadeResult {
        let service = CascadeService::Radarr;
        let Some(client) = &self.radarr else {
            return no_op(service, "radarr integration not configured");
        };
        if item.media_type != MediaType::Movie {
            return no_op(service, "item is not a movie");
        }
        let Some(tmdb_id) = item.external_ids.tmdb else {
            return no_op(service, "item has no tmdb id");
        };

        let movie = match client.find_by_tmdb_id(tmdb_id).await {
            Ok(Some(movie)) => movie,
            Ok(None) => return no_op(service, "movie not found in radarr"),
            Err(err) => return failure(service, format!("{err:#}")),
        };

        match client.delete_movie(movie.id).await {
            Ok(()) => {
                info!(item_id = item.item_id, "radarr cascade delete succeeded");
                success(service)
            }
            Err(err) => failure(service, format!("{err:#}")),
        }
    }

    async fn delete_via_sonarr(&self, item: &LibraryItemCache) -> CascadeResult {
        let service = CascadeService::Sonarr;
        let Some(client) = &self.sonarr else {
            return no_op(service, "sonarr integration not configured");
        };
        if item.media_type != MediaType::Episode {
            return no_op(service, "item is not a tv item");
        }
        let Some(tvdb_id) = item.external_ids.tvdb else {
            return no_op(service, "item has no tvdb id");
        };

        let series = match client.find_by_tvdb_id(tvdb_id).await {
            Ok(Some(series)) => series,
            Ok(None) => return no_op(service, "series not found in sonarr"),
            Err(err) => return failure(service, format!("{err:#}")),
        };

        match client.delete_series(series.id).await {
            Ok(()) => {
                info!(item_id = item.item_id, "sonarr cascade delete succeeded");
                success(service)
            }
            Err(err) => failure(service, format!("{err:#}")),
        }
    }

    async fn delete_via_overseerr(&self, item: &LibraryItemCache) -> CascadeResult {
        let service = CascadeService::Overseerr;
        let Some(client) = &self.overseerr else {
            return no_op(service, "overseerr integration not configured");
        };
        let Some(tmdb_id) = item.external_ids.tmdb else {
            return no_op(service, "item has no tmdb id");
        };

        let media = match client.find_movie_by_tmdb_id(tmdb_id).await {
            Ok(Some(media)) => media,
            Ok(None) => return no_op(service, "media not found in overseerr"),
            Err(err) => return failure(service, format!("{err:#}")),
        };

        match client.delete_request_and_media(&media).await {
            Ok(()) => {
                info!(item_id = item.item_id, "overseerr cascade cleanup succeeded");
                success(service)
            }
            Err(err) => failure(service, format!("{err:#}")),
        }
    }
}

fn success(service: CascadeService) -> CascadeResult {
    CascadeResult {
        service,
        success: true,
        error: None,
    }
}

fn no_op(service: CascadeService, reason: &str) -> CascadeResult {
    warn!(reason, ?service, "cascade task skipped");
    CascadeResult {
        service,
        success: false,
        error: None,
    }
}

fn failure(service: CascadeService, error: String) -> CascadeResult {
    warn!(%error, ?service, "cascade task failed");
    CascadeResult {
        service,
        success: false,
        error: Some(error),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::ExternalIds;
    use chrono::Utc;

    fn item(media_type: MediaType, tmdb: Option<i64>, tvdb: Option<i64>) -> LibraryItemCache {
        LibraryItemCache {
            server_id: 1,
            library_id: 1,
            item_id: 1,
            title: "Item".into(),
            year: Some(2020),
            added_at: Utc::now(),
            last_watched_at: None,
            episode_count: 0,
            resolution: None,
            file_size_bytes: 0,
            media_type,
            external_ids: ExternalIds {
                tmdb,
                tvdb,
                imdb: None,
            },
        }
    }

    #[tokio::test]
    async fn unconfigured_integrations_are_no_ops() {
        let deleter = CascadeDeleter::new(None, None, None, Duration::from_secs(1));
        let results = deleter
            .delete(&item(MediaType::Movie, Some(27205), None))
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.success));
        assert_eq!(results[0].service, CascadeService::Radarr);
        assert_eq!(results[1].service, CascadeService::Sonarr);
        assert_eq!(results[2].service, CascadeService::Overseerr);
    }

    #[tokio::test]
    async fn tv_item_skips_radarr_task() {
        let deleter = CascadeDeleter::new(None, None, None, Duration::from_secs(1));
        let results = deleter
            .delete(&item(MediaType::Episode, None, Some(5678)))
            .await;
        assert!(!results[0].success);
        assert!(results[0].error.is_none());
    }
}
