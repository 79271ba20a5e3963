//! The signed-in user's activity feed.

use std::sync::{Arc, Mutex};

use rally_supabase::{DataStore, Filter, Query};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::optimistic::patch;
use crate::{
    Backend, CacheUpdate, ChangeFeed, ChangeHandlers, Entity, EntityCache, MutationCoordinator,
    MutationFailure, Subscription, SyncError,
};

pub const ACTIVITIES_TABLE: &str = "activities";

/// Default number of activities fetched by [`ActivityFeed::load`].
pub const ACTIVITY_PAGE_SIZE: usize = 50;

/// Newest-first list of activities addressed to one user, kept live.
pub struct ActivityFeed {
    store: Arc<dyn DataStore>,
    feed: ChangeFeed,
    user_id: String,
    page_size: usize,
    cache: Arc<EntityCache>,
    coordinator: MutationCoordinator,
    error: Mutex<Option<Arc<SyncError>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ActivityFeed {
    pub fn new(backend: &Backend, user_id: impl Into<String>) -> Self {
        let cache = EntityCache::new(ACTIVITIES_TABLE);
        Self {
            store: Arc::clone(&backend.store),
            feed: backend.feed.clone(),
            user_id: user_id.into(),
            page_size: ACTIVITY_PAGE_SIZE,
            coordinator: MutationCoordinator::new(Arc::clone(&cache)),
            cache,
            error: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn activities(&self) -> Vec<Entity> {
        self.cache.list()
    }

    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache.subscribe()
    }

    pub fn failures(&self) -> broadcast::Receiver<MutationFailure> {
        self.coordinator.failures()
    }

    /// The error from the most recent failed load, if any.
    pub fn error(&self) -> Option<Arc<SyncError>> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_error(&self, error: Option<Arc<SyncError>>) {
        *self.error.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    /// Fetch the newest page. Change events that arrive meanwhile are replayed
    /// afterwards. On failure the error is kept and the list is left as is.
    pub async fn load(&self) -> Result<usize, Arc<SyncError>> {
        self.cache.begin_sync();
        let query = Query::table(ACTIVITIES_TABLE)
            .eq("user_id", self.user_id.as_str())
            .order_desc("created_at")
            .limit(self.page_size);

        match self.store.select(&query).await {
            Ok(rows) => {
                self.cache.finish_sync(rows);
                self.set_error(None);
                debug!(user_id = %self.user_id, count = self.cache.len(), "activities loaded");
                Ok(self.cache.len())
            }
            Err(e) => {
                self.cache.abort_sync();
                let error = Arc::new(SyncError::from(e));
                warn!(user_id = %self.user_id, error = %error, "failed to load activities");
                self.set_error(Some(Arc::clone(&error)));
                Err(error)
            }
        }
    }

    /// Subscribe to the user's activity changes, then load. Calling it again
    /// while subscribed only reloads.
    pub async fn start(&self) -> Result<usize, Arc<SyncError>> {
        {
            let mut subscription = self.subscription.lock().unwrap_or_else(|p| p.into_inner());
            if subscription.is_none() {
                let cache = Arc::clone(&self.cache);
                let handlers = ChangeHandlers::new().on_change(move |event| {
                    if let Err(e) = cache.apply_change(event) {
                        warn!(table = ACTIVITIES_TABLE, error = %e, "dropping activity change");
                    }
                });
                *subscription = Some(self.feed.subscribe(
                    ACTIVITIES_TABLE,
                    Some(Filter::eq("user_id", self.user_id.as_str())),
                    handlers,
                ));
                info!(user_id = %self.user_id, "activity feed started");
            }
        }
        self.load().await
    }

    /// Optimistically mark one activity read.
    pub async fn mark_read(&self, id: &str) -> Result<(), SyncError> {
        let already_read = self
            .cache
            .get(id)
            .ok_or_else(|| SyncError::MissingEntity(id.to_string()))?
            .bool_field("is_read")
            .unwrap_or(false);
        if already_read {
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        self.coordinator
            .update(id, patch("is_read", true), || async move {
                store.update(ACTIVITIES_TABLE, id, patch("is_read", true)).await
            })
            .await
            .map(|_| ())
    }

    /// Mark every unread activity read. Stops at the first failure; entries
    /// already confirmed stay read.
    pub async fn mark_all_read(&self) -> Result<usize, SyncError> {
        let unread: Vec<String> = self
            .activities()
            .into_iter()
            .filter(|a| !a.bool_field("is_read").unwrap_or(false))
            .map(|a| a.id().to_string())
            .collect();

        for id in &unread {
            self.mark_read(id).await?;
        }
        Ok(unread.len())
    }

    pub fn unread_count(&self) -> usize {
        self.cache
            .list()
            .iter()
            .filter(|a| !a.bool_field("is_read").unwrap_or(false))
            .count()
    }

    /// Dispose the subscription and close the cache.
    pub fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().unwrap_or_else(|p| p.into_inner()).take() {
            subscription.dispose();
        }
        self.cache.close();
        info!(user_id = %self.user_id, "activity feed stopped");
    }
}

impl Drop for ActivityFeed {
    fn drop(&mut self) {
        self.cache.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use rally_supabase::{ChangeEvent, MemoryRealtime, MemoryStore};
    use serde_json::json;

    fn seeded() -> (Arc<MemoryStore>, Arc<MemoryRealtime>, Backend) {
        let realtime = MemoryRealtime::new();
        let store = Arc::new(MemoryStore::new().with_feed(Arc::clone(&realtime)));
        store.seed(
            ACTIVITIES_TABLE,
            vec![
                row(json!({"id": "a1", "user_id": "me", "is_read": false, "created_at": "2024-03-01T10:00:00Z"})),
                row(json!({"id": "a2", "user_id": "me", "is_read": true, "created_at": "2024-03-02T10:00:00Z"})),
                row(json!({"id": "a3", "user_id": "me", "is_read": false, "created_at": "2024-03-03T10:00:00Z"})),
                row(json!({"id": "x1", "user_id": "someone", "is_read": false, "created_at": "2024-03-04T10:00:00Z"})),
            ],
        );
        let backend = Backend::new(store.clone(), realtime.clone());
        (store, realtime, backend)
    }

    fn ids(feed: &ActivityFeed) -> Vec<String> {
        feed.activities().iter().map(|a| a.id().to_string()).collect()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_load_newest_first_for_user() {
        let (_store, _realtime, backend) = seeded();
        let feed = ActivityFeed::new(&backend, "me").with_page_size(2);

        assert_eq!(feed.load().await.unwrap(), 2);
        assert_eq!(ids(&feed), ["a3", "a2"]);
        assert!(feed.error().is_none());
    }

    #[tokio::test]
    async fn test_load_failure_is_stored() {
        let (store, _realtime, backend) = seeded();
        store.set_failing(true);
        let feed = ActivityFeed::new(&backend, "me");

        assert!(feed.load().await.is_err());
        assert!(feed.activities().is_empty());
        assert!(matches!(
            feed.error().as_deref(),
            Some(SyncError::Backend(_))
        ));
        assert_eq!(feed.cache().state(), crate::SyncState::Disconnected);
    }

    #[tokio::test]
    async fn test_live_events_reach_cache() {
        let (_store, realtime, backend) = seeded();
        let feed = ActivityFeed::new(&backend, "me");
        feed.start().await.unwrap();
        assert_eq!(feed.unread_count(), 2);

        realtime.emit(ChangeEvent::insert(
            ACTIVITIES_TABLE,
            row(json!({"id": "a4", "user_id": "me", "is_read": false, "created_at": "2024-03-05T10:00:00Z"})),
        ));
        realtime.emit(ChangeEvent::insert(
            ACTIVITIES_TABLE,
            row(json!({"id": "x2", "user_id": "someone", "created_at": "2024-03-05T11:00:00Z"})),
        ));
        settle().await;

        assert_eq!(ids(&feed), ["a4", "a3", "a2", "a1"]);
        assert_eq!(feed.unread_count(), 3);
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let (store, _realtime, backend) = seeded();
        let feed = ActivityFeed::new(&backend, "me");
        feed.start().await.unwrap();

        assert_eq!(feed.mark_all_read().await.unwrap(), 2);
        assert_eq!(feed.unread_count(), 0);
        assert!(
            store
                .rows(ACTIVITIES_TABLE)
                .iter()
                .filter(|r| r["user_id"] == "me")
                .all(|r| r["is_read"] == true)
        );
    }

    #[tokio::test]
    async fn test_mark_read_failure_reverts() {
        let (store, _realtime, backend) = seeded();
        let feed = ActivityFeed::new(&backend, "me");
        feed.load().await.unwrap();
        let mut failures = feed.failures();
        store.set_failing(true);

        assert!(feed.mark_read("a1").await.is_err());
        assert_eq!(feed.cache().get("a1").unwrap().bool_field("is_read"), Some(false));
        assert_eq!(failures.try_recv().unwrap().entity_id, "a1");
    }

    #[tokio::test]
    async fn test_stop_disposes_and_ignores_late_events() {
        let (_store, realtime, backend) = seeded();
        let feed = ActivityFeed::new(&backend, "me");
        feed.start().await.unwrap();
        assert_eq!(realtime.channel_count(), 1);

        feed.stop();
        assert_eq!(realtime.channel_count(), 0);
        assert_eq!(
            realtime.emit(ChangeEvent::insert(ACTIVITIES_TABLE, row(json!({"id": "late", "user_id": "me"})))),
            0
        );
        assert!(feed.cache().is_closed());
    }
}
