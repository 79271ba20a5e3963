//! Likes on events.
//!
//! Each loaded event is cached with two derived fields, `is_liked` (by the
//! signed-in user) and `likes_count`. Toggling goes through the optimistic
//! coordinator; likes from other users arrive over the change feed and step
//! the count. The current user's own like rows echoing back are ignored since
//! the toggle already accounted for them.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rally_supabase::{
    ChangeEvent, ChangeKind, ChannelSpec, DataStore, EventFilter, Filter, Query, Row,
};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::{
    Backend, CacheUpdate, ChangeFeed, ChangeHandlers, Entity, EntityCache, MutationCoordinator,
    MutationFailure, Subscription, SyncError, SyncState, row,
};

pub const EVENTS_TABLE: &str = "events";
pub const EVENT_LIKES_TABLE: &str = "event_likes";

const LIKED_FIELD: &str = "is_liked";
const COUNT_FIELD: &str = "likes_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub is_liked: bool,
    pub likes_count: i64,
}

#[derive(Debug, Clone)]
struct LikeRow {
    event_id: String,
    user_id: String,
}

impl LikeRow {
    fn from_row(row: &Row) -> Option<(String, Self)> {
        let id = Entity::id_of(row)?;
        let event_id = row.get("event_id")?.as_str()?.to_string();
        let user_id = row.get("user_id")?.as_str()?.to_string();
        Some((id, Self { event_id, user_id }))
    }
}

/// Shared between the consumer and its change handlers.
struct LikeIndex {
    user_id: String,
    cache: Arc<EntityCache>,
    /// Like rows seen so far, by like id. Delete events usually only carry
    /// the id.
    likes: DashMap<String, LikeRow>,
}

impl LikeIndex {
    fn step(&self, event_id: &str, delta: i64) {
        self.cache.modify(event_id, |event| {
            let count = event.i64_field(COUNT_FIELD).unwrap_or(0);
            event.set(COUNT_FIELD, (count + delta).max(0));
            true
        });
    }

    fn on_like_inserted(&self, event: &ChangeEvent) {
        let Some((like_id, like)) = event.new.as_ref().and_then(LikeRow::from_row) else {
            warn!(table = EVENT_LIKES_TABLE, "like insert without event or user");
            return;
        };
        if !self.cache.contains(&like.event_id) {
            trace!(event_id = %like.event_id, "like for event not loaded");
            return;
        }
        if self.likes.insert(like_id.clone(), like.clone()).is_some() {
            debug!(like_id = %like_id, "duplicate like insert ignored");
            return;
        }
        if like.user_id == self.user_id {
            trace!(event_id = %like.event_id, "own like echoed");
            return;
        }
        self.step(&like.event_id, 1);
    }

    fn on_like_deleted(&self, event: &ChangeEvent) {
        let Some(old) = event.old.as_ref() else {
            return;
        };
        let Some(like_id) = Entity::id_of(old) else {
            return;
        };
        let like = match self.likes.remove(&like_id) {
            Some((_, like)) => like,
            // Full replica identity delivers the whole row.
            None => match LikeRow::from_row(old) {
                Some((_, like)) => like,
                None => {
                    trace!(like_id = %like_id, "delete for unknown like");
                    return;
                }
            },
        };
        if like.user_id == self.user_id || !self.cache.contains(&like.event_id) {
            return;
        }
        self.step(&like.event_id, -1);
    }
}

/// Like state for the events the user has opened.
pub struct EventInteractions {
    store: Arc<dyn DataStore>,
    feed: ChangeFeed,
    index: Arc<LikeIndex>,
    coordinator: MutationCoordinator,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventInteractions {
    pub fn new(backend: &Backend, user_id: impl Into<String>) -> Self {
        let cache = EntityCache::new(EVENTS_TABLE);
        cache.set_state(SyncState::Live);
        Self {
            store: Arc::clone(&backend.store),
            feed: backend.feed.clone(),
            coordinator: MutationCoordinator::new(Arc::clone(&cache)),
            index: Arc::new(LikeIndex {
                user_id: user_id.into(),
                cache,
                likes: DashMap::new(),
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.index.cache
    }

    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.index.cache.subscribe()
    }

    pub fn failures(&self) -> broadcast::Receiver<MutationFailure> {
        self.coordinator.failures()
    }

    pub fn like_state(&self, event_id: &str) -> Option<LikeState> {
        let event = self.index.cache.get(event_id)?;
        Some(LikeState {
            is_liked: event.bool_field(LIKED_FIELD).unwrap_or(false),
            likes_count: event.i64_field(COUNT_FIELD).unwrap_or(0),
        })
    }

    /// Fetch an event and its likes into the cache.
    pub async fn load(&self, event_id: &str) -> Result<LikeState, SyncError> {
        let rows = self
            .store
            .select(&Query::table(EVENTS_TABLE).eq("id", event_id).limit(1))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::MissingEntity(event_id.to_string()))?;
        let mut event = Entity::from_row(row)?;

        let likes = self
            .store
            .select(&Query::table(EVENT_LIKES_TABLE).eq("event_id", event_id))
            .await?;
        let mut is_liked = false;
        for like in &likes {
            if let Some((like_id, like)) = LikeRow::from_row(like) {
                is_liked |= like.user_id == self.index.user_id;
                self.index.likes.insert(like_id, like);
            }
        }

        let state = LikeState {
            is_liked,
            likes_count: likes.len() as i64,
        };
        event.set(LIKED_FIELD, state.is_liked);
        event.set(COUNT_FIELD, state.likes_count);
        self.index.cache.insert(event);
        debug!(event_id = %event_id, liked = state.is_liked, count = state.likes_count, "event likes loaded");
        Ok(state)
    }

    /// Listen for like changes and edits to loaded events.
    pub fn start(&self) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        if !subscriptions.is_empty() {
            return;
        }

        let inserted = Arc::clone(&self.index);
        let deleted = Arc::clone(&self.index);
        subscriptions.push(self.feed.subscribe(
            EVENT_LIKES_TABLE,
            None,
            ChangeHandlers::new()
                .on_insert(move |event| inserted.on_like_inserted(event))
                .on_delete(move |event| deleted.on_like_deleted(event)),
        ));

        let cache = Arc::clone(&self.index.cache);
        subscriptions.push(self.feed.subscribe_spec(
            ChannelSpec::table(EVENTS_TABLE).with_event(EventFilter::Only(ChangeKind::Update)),
            ChangeHandlers::new().on_update(move |event| {
                let loaded = event
                    .new
                    .as_ref()
                    .and_then(Entity::id_of)
                    .is_some_and(|id| cache.contains(&id));
                if loaded && let Err(e) = cache.apply_change(event) {
                    warn!(table = EVENTS_TABLE, error = %e, "dropping event change");
                }
            }),
        ));
        info!(user_id = %self.index.user_id, "event interactions started");
    }

    /// Like or unlike an event. Returns the new liked state.
    pub async fn toggle_like(&self, event_id: &str) -> Result<bool, SyncError> {
        let store = Arc::clone(&self.store);
        let user_id = self.index.user_id.clone();
        self.coordinator
            .toggle(event_id, LIKED_FIELD, Some(COUNT_FIELD), |liked| async move {
                if liked {
                    let like = row(serde_json::json!({"event_id": event_id, "user_id": user_id}));
                    store.insert(EVENT_LIKES_TABLE, like).await.map(|_| ())
                } else {
                    store
                        .delete(
                            EVENT_LIKES_TABLE,
                            &[Filter::eq("event_id", event_id), Filter::eq("user_id", user_id)],
                        )
                        .await
                }
            })
            .await
    }

    pub fn stop(&self) {
        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for subscription in &subscriptions {
            subscription.dispose();
        }
        self.index.cache.close();
    }
}

impl Drop for EventInteractions {
    fn drop(&mut self) {
        self.index.cache.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_supabase::{MemoryRealtime, MemoryStore};
    use serde_json::json;

    fn setup(likes: usize) -> (Arc<MemoryStore>, Arc<MemoryRealtime>, EventInteractions) {
        let realtime = MemoryRealtime::new();
        let store = Arc::new(MemoryStore::new().with_feed(Arc::clone(&realtime)));
        store.seed(EVENTS_TABLE, vec![row(json!({"id": "e1", "title": "Picnic"}))]);
        store.seed(
            EVENT_LIKES_TABLE,
            (0..likes).map(|i| row(json!({"id": format!("l{}", i), "event_id": "e1", "user_id": format!("u{}", i)}))),
        );
        let backend = Backend::new(store.clone(), realtime.clone());
        (store, realtime, EventInteractions::new(&backend, "me"))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn state(liked: bool, count: i64) -> LikeState {
        LikeState {
            is_liked: liked,
            likes_count: count,
        }
    }

    #[tokio::test]
    async fn test_like_toggle_scenario() {
        let (store, _realtime, interactions) = setup(3);
        interactions.start();
        assert_eq!(interactions.load("e1").await.unwrap(), state(false, 3));

        assert!(interactions.toggle_like("e1").await.unwrap());
        settle().await;
        assert_eq!(interactions.like_state("e1"), Some(state(true, 4)), "own echo ignored");
        assert_eq!(store.rows(EVENT_LIKES_TABLE).len(), 4);

        store.set_failing(true);
        let mut failures = interactions.failures();
        assert!(interactions.toggle_like("e1").await.is_err());
        assert_eq!(interactions.like_state("e1"), Some(state(true, 4)));
        assert!(!failures.try_recv().unwrap().message.is_empty());

        store.set_failing(false);
        assert!(!interactions.toggle_like("e1").await.unwrap());
        settle().await;
        assert_eq!(interactions.like_state("e1"), Some(state(false, 3)));
    }

    #[tokio::test]
    async fn test_other_users_likes_step_count() {
        let (store, realtime, interactions) = setup(1);
        interactions.start();
        interactions.load("e1").await.unwrap();

        store
            .insert(EVENT_LIKES_TABLE, row(json!({"id": "l9", "event_id": "e1", "user_id": "friend"})))
            .await
            .unwrap();
        settle().await;
        assert_eq!(interactions.like_state("e1"), Some(state(false, 2)));

        // Redelivery of the same row is idempotent.
        realtime.emit(ChangeEvent::insert(
            EVENT_LIKES_TABLE,
            row(json!({"id": "l9", "event_id": "e1", "user_id": "friend"})),
        ));
        settle().await;
        assert_eq!(interactions.like_state("e1"), Some(state(false, 2)));

        // Deletes only carry the id.
        store.delete_by_id(EVENT_LIKES_TABLE, "l0").await.unwrap();
        settle().await;
        assert_eq!(interactions.like_state("e1"), Some(state(false, 1)));
    }

    #[tokio::test]
    async fn test_event_edits_keep_like_fields() {
        let (store, _realtime, interactions) = setup(2);
        interactions.start();
        interactions.load("e1").await.unwrap();

        store
            .update(EVENTS_TABLE, "e1", row(json!({"title": "Beach picnic"})))
            .await
            .unwrap();
        settle().await;

        let event = interactions.cache().get("e1").unwrap();
        assert_eq!(event.str_field("title"), Some("Beach picnic"));
        assert_eq!(interactions.like_state("e1"), Some(state(false, 2)));
    }

    #[tokio::test]
    async fn test_load_unknown_event() {
        let (_store, _realtime, interactions) = setup(0);
        assert!(matches!(
            interactions.load("nope").await,
            Err(SyncError::MissingEntity(_))
        ));
    }
}
