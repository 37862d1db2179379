//! Subscriber registry and event payloads.
//!
//! Callbacks run on the events runner, never on the caller's thread and
//! never under the storage lock. A [`Subscription`] unsubscribes when it is
//! dropped.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::status::Status;
use crate::country::CountryId;
use crate::download::Progress;
use crate::error::ErrorKind;
use crate::local::LocalFile;

/// A node's status at the moment it changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub country_id: CountryId,
    pub status: Status,
    pub error: ErrorKind,
}

/// Progress of a downloading leaf or one of its ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub country_id: CountryId,
    pub progress: Progress,
}

pub type StatusCallback = Box<dyn Fn(&StatusEvent) + Send + Sync>;
pub type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Host hook run after a package has been placed on disk.
pub type DownloadedCallback = Arc<dyn Fn(&CountryId, &LocalFile) + Send + Sync>;

struct Subscriber {
    id: u64,
    on_status: StatusCallback,
    on_progress: ProgressCallback,
}

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    entries: Vec<Arc<Subscriber>>,
}

pub(crate) type SharedSubscribers = Arc<Mutex<Subscribers>>;

impl Subscribers {
    pub(crate) fn subscribe(
        shared: &SharedSubscribers,
        on_status: StatusCallback,
        on_progress: ProgressCallback,
    ) -> Subscription {
        let mut subscribers = shared.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.entries.push(Arc::new(Subscriber {
            id,
            on_status,
            on_progress,
        }));
        debug!(subscription = id, "Subscribed");
        Subscription {
            id,
            registry: Arc::downgrade(shared),
        }
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|s| s.id != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(shared: &SharedSubscribers) -> Vec<Arc<Subscriber>> {
        shared.lock().entries.clone()
    }

    /// Deliver status events to every current subscriber.
    pub(crate) fn deliver_status(shared: &SharedSubscribers, events: &[StatusEvent]) {
        for event in events {
            for subscriber in Self::snapshot(shared) {
                (subscriber.on_status)(event);
            }
        }
    }

    /// Deliver progress events to every current subscriber.
    pub(crate) fn deliver_progress(shared: &SharedSubscribers, events: &[ProgressEvent]) {
        for event in events {
            for subscriber in Self::snapshot(shared) {
                (subscriber.on_progress)(event);
            }
        }
    }
}

/// Keeps a pair of callbacks registered. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.id);
            debug!(subscription = self.id, "Unsubscribed");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
