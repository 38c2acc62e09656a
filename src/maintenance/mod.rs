//! Maintenance evaluator (spec §4.6): for a single [`MaintenanceRule`],
//! unions library items across its (server, library) pairs, merges
//! cross-server last-watched timestamps by external id, and selects
//! candidates per criterion.

pub mod resolution;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::{
    model::{LibraryItemCache, MaintenanceCandidate, MaintenanceCriterion, MaintenanceRule},
    repository::Repository,
};

use resolution::is_low_resolution;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct MaintenanceEvaluator {
    repository: Arc<dyn Repository>,
}

impl MaintenanceEvaluator {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    pub async fn evaluate(&self, rule: &MaintenanceRule) -> Result<Vec<MaintenanceCandidate>> {
        if !rule.enabled {
            return Ok(Vec::new());
        }

        let items = self
            .repository
            .list_items_for_libraries(rule.libraries.clone())
            .await?;

        let item_ids: Vec<i64> = items.iter().map(|i| i.item_id).collect();
        let cross_server_watch_times = self
            .repository
            .get_cross_server_watch_times(item_ids)
            .await?;

        let now = Utc::now();
        let mut candidates = Vec::new();

        for item in &items {
            if let Some(media_type) = rule.media_type {
                if item.media_type != media_type {
                    continue;
                }
            }

            let candidate = match rule.criterion {
                MaintenanceCriterion::UnwatchedMovie | MaintenanceCriterion::UnwatchedTvNone => {
                    unwatched_candidate(item, rule, &cross_server_watch_times, now)
                }
                MaintenanceCriterion::LowResolution => low_resolution_candidate(item, rule, now),
                MaintenanceCriterion::LargeFiles => large_file_candidate(item, rule, now),
            };

            if let Some(candidate) = candidate {
                candidates.push(candidate);
            }
        }

        Ok(candidates)
    }
}

fn unwatched_candidate(
    item: &LibraryItemCache,
    rule: &MaintenanceRule,
    cross_server_watch_times: &std::collections::HashMap<i64, Option<DateTime<Utc>>>,
    now: DateTime<Utc>,
) -> Option<MaintenanceCandidate> {
    let last_watched = item.last_watched_at.or_else(|| {
        cross_server_watch_times
            .get(&item.item_id)
            .copied()
            .flatten()
    });
    let reference = last_watched.unwrap_or(item.added_at);
    if now - reference <= Duration::days(rule.days) {
        return None;
    }

    let reason = if last_watched.is_none() {
        format!("Never watched ({} days)", rule.days)
    } else {
        format!("Not watched in {} days", rule.days)
    };

    Some(MaintenanceCandidate {
        rule_id: rule.id,
        library_item_id: item.item_id,
        reason,
        computed_at: now,
    })
}

fn low_resolution_candidate(
    item: &LibraryItemCache,
    rule: &MaintenanceRule,
    now: DateTime<Utc>,
) -> Option<MaintenanceCandidate> {
    if !is_low_resolution(item.resolution.as_deref(), rule.max_height) {
        return None;
    }
    Some(MaintenanceCandidate {
        rule_id: rule.id,
        library_item_id: item.item_id,
        reason: format!(
            "Resolution {} is at or below {}p",
            item.resolution.as_deref().unwrap_or("unknown"),
            rule.max_height
        ),
        computed_at: now,
    })
}

fn large_file_candidate(
    item: &LibraryItemCache,
    rule: &MaintenanceRule,
    now: DateTime<Utc>,
) -> Option<MaintenanceCandidate> {
    let threshold_bytes = (rule.min_size_gb * BYTES_PER_GIB) as i64;
    if item.file_size_bytes < threshold_bytes {
        return None;
    }
    Some(MaintenanceCandidate {
        rule_id: rule.id,
        library_item_id: item.item_id,
        reason: format!(
            "File size {:.1} GiB exceeds {:.1} GiB",
            item.file_size_bytes as f64 / BYTES_PER_GIB,
            rule.min_size_gb
        ),
        computed_at: now,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{ExternalIds, MediaType};
    use std::sync::Arc;

    fn item(id: i64, added_days_ago: i64, last_watched: Option<DateTime<Utc>>) -> LibraryItemCache {
        LibraryItemCache {
            server_id: 1,
            library_id: 1,
            item_id: id,
            title: "Movie".into(),
            year: Some(2020),
            added_at: Utc::now() - Duration::days(added_days_ago),
            last_watched_at: last_watched,
            episode_count: 0,
            resolution: Some("720p".into()),
            file_size_bytes: 1,
            media_type: MediaType::Movie,
            external_ids: ExternalIds { tmdb: None, tvdb: None, imdb: None },
        }
    }

    #[tokio::test]
    async fn unwatched_movie_never_watched() {
        let repo = crate::repository::InMemoryRepository::default();
        repo.seed_library_items(vec![item(1, 100, None)]);
        let evaluator = MaintenanceEvaluator::new(Arc::new(repo));

        let rule = MaintenanceRule {
            id: 1,
            libraries: vec![(1, 1)],
            days: 30,
            criterion: MaintenanceCriterion::UnwatchedMovie,
            ..MaintenanceRule::default()
        };

        let candidates = evaluator.evaluate(&rule).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].reason.contains("Never watched"));
    }

    #[tokio::test]
    async fn recently_added_is_not_a_candidate() {
        let repo = crate::repository::InMemoryRepository::default();
        repo.seed_library_items(vec![item(1, 5, None)]);
        let evaluator = MaintenanceEvaluator::new(Arc::new(repo));

        let rule = MaintenanceRule {
            id: 1,
            libraries: vec![(1, 1)],
            days: 30,
            criterion: MaintenanceCriterion::UnwatchedMovie,
            ..MaintenanceRule::default()
        };

        assert!(evaluator.evaluate(&rule).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_files_threshold() {
        let repo = crate::repository::InMemoryRepository::default();
        let mut big = item(1, 1, Some(Utc::now()));
        big.file_size_bytes = 20 * 1024 * 1024 * 1024;
        repo.seed_library_items(vec![big]);
        let evaluator = MaintenanceEvaluator::new(Arc::new(repo));

        let rule = MaintenanceRule {
            id: 1,
            libraries: vec![(1, 1)],
            criterion: MaintenanceCriterion::LargeFiles,
            min_size_gb: 10.0,
            ..MaintenanceRule::default()
        };

        let candidates = evaluator.evaluate(&rule).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }
}
