//! Snapshot fan-out to current-sessions subscribers (spec §3 ownership
//! notes, §4.2, §5). Subscribers hold a weak reference; the poller
//! delivers best-effort and never blocks on a slow consumer — a new
//! snapshot simply overwrites whatever sat in the single slot.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::model::ActiveStream;

pub struct SubscriberHandle {
    slot: Mutex<Option<Vec<ActiveStream>>>,
    notify: Notify,
}

impl SubscriberHandle {
    /// Waits for the next snapshot. Consumers that poll this slower than
    /// the tick interval simply miss intermediate snapshots; they are
    /// never queued.
    pub async fn recv(&self) -> Vec<ActiveStream> {
        loop {
            if let Some(snapshot) = self.slot.lock().unwrap().take() {
                return snapshot;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Default)]
pub struct Registry {
    subscribers: Mutex<Vec<Weak<SubscriberHandle>>>,
}

impl Registry {
    pub fn subscribe(&self) -> Arc<SubscriberHandle> {
        let handle = Arc::new(SubscriberHandle {
            slot: Mutex::new(None),
            notify: Notify::new(),
        });
        self.subscribers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&handle));
        handle
    }

    pub fn unsubscribe(&self, handle: &Arc<SubscriberHandle>) {
        let ptr = Arc::as_ptr(handle);
        self.subscribers
            .lock()
            .unwrap()
            .retain(|w| !std::ptr::eq(w.as_ptr(), ptr));
    }

    /// Publishes a full snapshot to every live subscriber, pruning dead
    /// (dropped) ones along the way. Consumers must tolerate being
    /// notified with an identical snapshot.
    pub fn publish(&self, snapshot: &[ActiveStream]) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|w| w.upgrade().is_some());
        for weak in subs.iter() {
            if let Some(handle) = weak.upgrade() {
                *handle.slot.lock().unwrap() = Some(snapshot.to_vec());
                handle.notify.notify_one();
            }
        }
    }
}
