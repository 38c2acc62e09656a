//! History persistor + bounded retry queue (spec §4.3). `insert` is
//! attempted once inline; on failure the entry is queued as
//! `(entry, attempts=1, not_before=now+30s)` and drained FIFO each tick,
//! dropped after 3 total attempts.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use crate::{model::WatchHistoryEntry, repository::Repository};

const RETRY_DELAY: Duration = Duration::seconds(30);
const MAX_ATTEMPTS: u32 = 3;

struct QueuedEntry {
    entry: WatchHistoryEntry,
    attempts: u32,
    not_before: DateTime<Utc>,
}

pub struct HistoryPersistor {
    repository: Arc<dyn Repository>,
    queue: Mutex<Vec<QueuedEntry>>,
}

impl HistoryPersistor {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Attempts the insert inline; on failure, enqueues for retry rather
    /// than surfacing the error (spec §7: "enqueue to bounded retry
    /// queue; final failure logged and dropped").
    pub async fn insert(&self, entry: WatchHistoryEntry) {
        let session_key = entry.session_id.clone();
        match self.repository.insert_history(entry.clone()).await {
            Ok(()) => {}
            Err(err) => {
                warn!(session_key, "history insert failed, enqueuing for retry: {err:#}");
                self.queue.lock().unwrap().push(QueuedEntry {
                    entry,
                    attempts: 1,
                    not_before: Utc::now() + RETRY_DELAY,
                });
            }
        }
    }

    /// Drains every entry whose `not_before` has passed, in FIFO enqueue
    /// order (spec §5: "retry queue is FIFO by enqueue time per tick").
    pub async fn drain_retries(&self) {
        let now = Utc::now();
        let due: Vec<QueuedEntry> = {
            let mut queue = self.queue.lock().unwrap();
            let (due, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *queue).into_iter().partition(|q| q.not_before <= now);
            *queue = pending;
            due
        };

        for mut queued in due {
            let session_key = queued.entry.session_id.clone();
            match self.repository.insert_history(queued.entry.clone()).await {
                Ok(()) => {}
                Err(err) => {
                    queued.attempts += 1;
                    if queued.attempts >= MAX_ATTEMPTS {
                        error!(
                            session_key,
                            attempts = queued.attempts,
                            "history retry exhausted, dropping entry: {err:#}"
                        );
                    } else {
                        queued.not_before = now + RETRY_DELAY;
                        self.queue.lock().unwrap().push(queued);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
