//! In-memory change feed.
//!
//! Stores objects in a `DashMap`, stamps a monotonically increasing resource
//! version on every write and fans notifications out over a broadcast
//! channel. Used to drive the cache in tests, benchmarks and the CLI, and as
//! the adapter shape for real watch clients.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{FeedError, Listed, Resource, ResourceFeed, ResourceVersion, WatchEvent, WatchStream};

/// Default number of buffered notifications per subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory list/watch source for one resource kind.
pub struct MemoryFeed<T: Resource> {
    objects: DashMap<String, T>,
    /// Serializes version assignment with the matching broadcast so that
    /// subscribers observe events in version order.
    version: Mutex<ResourceVersion>,
    events: broadcast::Sender<WatchEvent<T>>,
    unavailable: AtomicBool,
}

impl<T: Resource> MemoryFeed<T> {
    /// Create an empty feed whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            objects: DashMap::new(),
            version: Mutex::new(ResourceVersion::ZERO),
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Create a feed pre-populated with `objects`, without notifications.
    pub fn with_objects(objects: impl IntoIterator<Item = T>) -> Self {
        let feed = Self::new(DEFAULT_CHANNEL_CAPACITY);
        for object in objects {
            feed.apply_silently(object);
        }
        feed
    }

    /// Create or replace an object and notify subscribers.
    ///
    /// Returns the object as stored, stamped with its new resource version.
    pub fn apply(&self, object: T) -> T {
        self.write(object, true)
    }

    /// Create or replace an object without notifying subscribers.
    ///
    /// Simulates a notification lost in transit: only a resync will surface
    /// the change.
    pub fn apply_silently(&self, object: T) -> T {
        self.write(object, false)
    }

    /// Delete an object and notify subscribers.
    pub fn delete(&self, key: &str) -> Option<T> {
        self.remove(key, true)
    }

    /// Delete an object without notifying subscribers.
    pub fn delete_silently(&self, key: &str) -> Option<T> {
        self.remove(key, false)
    }

    /// Make `list` and `get` fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn current_version(&self) -> ResourceVersion {
        *self.version.lock()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn write(&self, mut object: T, notify: bool) -> T {
        let mut version = self.version.lock();
        *version = version.next();
        object.set_resource_version(*version);

        let previous = self
            .objects
            .insert(object.key().to_string(), object.clone());

        if notify {
            let event = if previous.is_some() {
                WatchEvent::Modified(object.clone())
            } else {
                WatchEvent::Added(object.clone())
            };
            // No subscribers is not an error for a feed.
            let _ = self.events.send(event);
        }

        debug!(
            kind = T::KIND,
            key = %object.key(),
            resource_version = %object.resource_version(),
            notify,
            "Stored object"
        );
        object
    }

    fn remove(&self, key: &str, notify: bool) -> Option<T> {
        let mut version = self.version.lock();
        let (_, mut object) = self.objects.remove(key)?;
        *version = version.next();
        object.set_resource_version(*version);

        if notify {
            let _ = self.events.send(WatchEvent::Deleted(object.clone()));
        }

        debug!(
            kind = T::KIND,
            key = %key,
            resource_version = %object.resource_version(),
            notify,
            "Deleted object"
        );
        Some(object)
    }

    fn ensure_available(&self) -> Result<(), FeedError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError::Unavailable {
                kind: T::KIND,
                reason: "feed marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> Listed<T> {
        let version = self.version.lock();
        let mut items: Vec<T> = self.objects.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.key().cmp(b.key()));
        Listed::new(items, *version)
    }
}

impl<T: Resource> Default for MemoryFeed<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl<T: Resource> ResourceFeed<T> for MemoryFeed<T> {
    async fn list(&self) -> Result<Listed<T>, FeedError> {
        self.ensure_available()?;
        Ok(self.snapshot())
    }

    async fn get(&self, key: &str) -> Result<Option<T>, FeedError> {
        self.ensure_available()?;
        Ok(self.objects.get(key).map(|e| e.value().clone()))
    }

    fn watch(&self) -> WatchStream<T> {
        BroadcastStream::new(self.events.subscribe())
            .map(|item| {
                item.map_err(|BroadcastStreamRecvError::Lagged(missed)| FeedError::Lagged {
                    kind: T::KIND,
                    missed,
                })
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::{OrganizationId, WorkspaceRecord};

    fn workspace(name: &str) -> WorkspaceRecord {
        WorkspaceRecord::new(name, OrganizationId::new("org"))
    }

    #[tokio::test]
    async fn test_apply_stamps_increasing_versions() {
        let feed = MemoryFeed::default();
        let a = feed.apply(workspace("a"));
        let b = feed.apply(workspace("b"));
        let a2 = feed.apply(workspace("a"));

        assert_eq!(a.resource_version, ResourceVersion::new(1));
        assert_eq!(b.resource_version, ResourceVersion::new(2));
        assert_eq!(a2.resource_version, ResourceVersion::new(3));
        assert_eq!(feed.current_version(), ResourceVersion::new(3));
        assert_eq!(feed.len(), 2);
    }

    #[tokio::test]
    async fn test_watch_delivers_added_modified_deleted() {
        let feed = MemoryFeed::default();
        let mut stream = feed.watch();

        feed.apply(workspace("a"));
        feed.apply(workspace("a"));
        feed.delete("a");

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let third = stream.next().await.unwrap().unwrap();

        assert!(matches!(first, WatchEvent::Added(_)));
        assert!(matches!(second, WatchEvent::Modified(_)));
        assert!(matches!(third, WatchEvent::Deleted(ref w) if w.resource_version == ResourceVersion::new(3)));
    }

    #[tokio::test]
    async fn test_silent_writes_are_listed_but_not_watched() {
        let feed = MemoryFeed::default();
        let mut stream = feed.watch();

        feed.apply_silently(workspace("hidden"));
        feed.apply(workspace("visible"));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.key(), "visible");

        let listed = feed.list().await.unwrap();
        let keys: Vec<_> = listed.items.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(keys, vec!["hidden", "visible"]);
        assert_eq!(listed.resource_version, ResourceVersion::new(2));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports_lag() {
        let feed = MemoryFeed::new(2);
        let mut stream = feed.watch();

        for i in 0..5 {
            feed.apply(workspace(&format!("ws-{i}")));
        }

        match stream.next().await.unwrap() {
            Err(FeedError::Lagged { kind, missed }) => {
                assert_eq!(kind, "workspace");
                assert_eq!(missed, 3);
            }
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_feed_fails_list_and_get() {
        let feed: MemoryFeed<WorkspaceRecord> = MemoryFeed::default();
        feed.set_unavailable(true);
        assert!(matches!(feed.list().await, Err(FeedError::Unavailable { .. })));
        assert!(feed.get("a").await.is_err());

        feed.set_unavailable(false);
        assert!(feed.list().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_noop() {
        let feed: MemoryFeed<WorkspaceRecord> = MemoryFeed::default();
        assert!(feed.delete("missing").is_none());
        assert_eq!(feed.current_version(), ResourceVersion::ZERO);
    }
}
