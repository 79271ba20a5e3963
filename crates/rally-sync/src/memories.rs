//! Stories and their threaded replies.
//!
//! Stories are a plain newest-first cache. Replies are kept as one
//! [`ReplyTree`] per story: live inserts attach incrementally, and an insert
//! whose parent is unknown triggers a refetch and full rebuild of that story's
//! tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rally_supabase::{
    ChangeEvent, ChangeKind, ChannelSpec, DataStore, EventFilter, Filter, FilterOp, Query,
};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::optimistic::{is_temp_id, temp_id};
use crate::tree::InsertOutcome;
use crate::{
    Backend, CacheUpdate, ChangeFeed, ChangeHandlers, Entity, EntityCache, MutationFailure,
    MutationKind, ReplyNode, ReplyTree, Subscription, SyncError, row,
};

pub const STORIES_TABLE: &str = "stories";
pub const STORY_REPLIES_TABLE: &str = "story_replies";

const TREE_UPDATE_CAPACITY: usize = 256;

/// Reply trees by story id, shared with change handlers and refetch tasks.
struct ReplyState {
    store: Arc<dyn DataStore>,
    trees: Mutex<HashMap<String, ReplyTree>>,
    /// Story ids whose tree changed.
    updates_tx: broadcast::Sender<String>,
    failures_tx: broadcast::Sender<MutationFailure>,
    closed: AtomicBool,
}

impl ReplyState {
    fn trees(&self) -> MutexGuard<'_, HashMap<String, ReplyTree>> {
        self.trees.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify(&self, story_id: &str) {
        if self.updates_tx.send(story_id.to_string()).is_err() {
            trace!(story_id = %story_id, "no subscribers for reply update");
        }
    }

    async fn fetch(&self, story_id: &str) -> Result<ReplyTree, SyncError> {
        let rows = self
            .store
            .select(
                &Query::table(STORY_REPLIES_TABLE)
                    .eq("story_id", story_id)
                    .order_asc("created_at"),
            )
            .await?;
        let entities = rows
            .into_iter()
            .filter_map(|row| match Entity::from_row(row) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(story_id = %story_id, error = %e, "skipping invalid reply row");
                    None
                }
            })
            .collect::<Vec<_>>();
        Ok(ReplyTree::build(entities))
    }

    async fn rebuild(&self, story_id: &str) -> Result<Vec<ReplyNode>, SyncError> {
        let tree = self.fetch(story_id).await?;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let nested = tree.nested();
        self.trees().insert(story_id.to_string(), tree);
        self.notify(story_id);
        Ok(nested)
    }

    fn on_reply_upserted(self: &Arc<Self>, event: &ChangeEvent) {
        if self.is_closed() {
            return;
        }
        let entity = match event.new.clone().map(Entity::from_row) {
            Some(Ok(entity)) => entity,
            Some(Err(e)) => {
                warn!(table = STORY_REPLIES_TABLE, error = %e, "dropping reply change");
                return;
            }
            None => return,
        };
        let Some(story_id) = entity.str_field("story_id").map(str::to_string) else {
            return;
        };

        let outcome = match self.trees().get_mut(&story_id) {
            Some(tree) => tree.insert(entity),
            None => return,
        };
        match outcome {
            InsertOutcome::NeedsRebuild { parent_id } => {
                debug!(story_id = %story_id, parent_id = %parent_id, "refetching replies");
                let state = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = state.rebuild(&story_id).await {
                        warn!(story_id = %story_id, error = %e, "reply rebuild failed");
                    }
                });
            }
            _ => self.notify(&story_id),
        }
    }

    fn on_reply_deleted(&self, event: &ChangeEvent) {
        if self.is_closed() {
            return;
        }
        let Some(id) = event.old.as_ref().and_then(Entity::id_of) else {
            return;
        };
        let mut changed = Vec::new();
        for (story_id, tree) in self.trees().iter_mut() {
            if !tree.remove(&id).is_empty() {
                changed.push(story_id.clone());
            }
        }
        for story_id in changed {
            self.notify(&story_id);
        }
    }

    fn report(&self, entity_id: &str, kind: MutationKind, error: SyncError) -> SyncError {
        warn!(table = STORY_REPLIES_TABLE, id = %entity_id, kind = %kind, error = %error, "reply write failed, reverted");
        let failure = MutationFailure {
            table: STORY_REPLIES_TABLE.to_string(),
            entity_id: entity_id.to_string(),
            kind,
            message: error.user_message(),
        };
        if self.failures_tx.send(failure).is_err() {
            debug!("no subscribers for mutation failure");
        }
        error
    }
}

/// Stories feed plus reply threads.
pub struct Memories {
    store: Arc<dyn DataStore>,
    feed: ChangeFeed,
    user_id: String,
    stories: Arc<EntityCache>,
    replies: Arc<ReplyState>,
    watches: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl Memories {
    pub fn new(backend: &Backend, user_id: impl Into<String>) -> Self {
        let (updates_tx, _) = broadcast::channel(TREE_UPDATE_CAPACITY);
        let (failures_tx, _) = broadcast::channel(TREE_UPDATE_CAPACITY);
        Self {
            store: Arc::clone(&backend.store),
            feed: backend.feed.clone(),
            user_id: user_id.into(),
            stories: EntityCache::new(STORIES_TABLE),
            replies: Arc::new(ReplyState {
                store: Arc::clone(&backend.store),
                trees: Mutex::new(HashMap::new()),
                updates_tx,
                failures_tx,
                closed: AtomicBool::new(false),
            }),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn stories(&self) -> Vec<Entity> {
        self.stories.list()
    }

    pub fn story_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.stories.subscribe()
    }

    /// Story ids whose reply tree changed.
    pub fn reply_updates(&self) -> broadcast::Receiver<String> {
        self.replies.updates_tx.subscribe()
    }

    pub fn failures(&self) -> broadcast::Receiver<MutationFailure> {
        self.replies.failures_tx.subscribe()
    }

    /// Fetch all stories, newest first.
    pub async fn load_stories(&self) -> Result<usize, SyncError> {
        self.stories.begin_sync();
        match self
            .store
            .select(&Query::table(STORIES_TABLE).order_desc("created_at"))
            .await
        {
            Ok(rows) => {
                self.stories.finish_sync(rows);
                Ok(self.stories.len())
            }
            Err(e) => {
                self.stories.abort_sync();
                Err(e.into())
            }
        }
    }

    /// Fetch a story's replies and build its tree.
    pub async fn load_replies(&self, story_id: &str) -> Result<Vec<ReplyNode>, SyncError> {
        self.replies.rebuild(story_id).await
    }

    /// Current reply tree for a story, empty if never loaded.
    pub fn replies(&self, story_id: &str) -> Vec<ReplyNode> {
        self.replies
            .trees()
            .get(story_id)
            .map(ReplyTree::nested)
            .unwrap_or_default()
    }

    /// Follow a story's replies live. Loads the tree first if needed.
    pub async fn watch_replies(&self, story_id: &str) -> Result<(), SyncError> {
        if self.watches.lock().unwrap_or_else(|p| p.into_inner()).contains_key(story_id) {
            return Ok(());
        }

        let upserted = Arc::clone(&self.replies);
        let changes = self.feed.subscribe(
            STORY_REPLIES_TABLE,
            Some(Filter::eq("story_id", story_id)),
            ChangeHandlers::new()
                .on_insert({
                    let state = Arc::clone(&upserted);
                    move |event| state.on_reply_upserted(event)
                })
                .on_update(move |event| upserted.on_reply_upserted(event)),
        );
        // Deletes carry only the id, so they cannot be filtered by story.
        let deleted = Arc::clone(&self.replies);
        let deletes = self.feed.subscribe_spec(
            ChannelSpec::table(STORY_REPLIES_TABLE).with_event(EventFilter::Only(ChangeKind::Delete)),
            ChangeHandlers::new().on_delete(move |event| deleted.on_reply_deleted(event)),
        );
        self.watches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(story_id.to_string(), vec![changes, deletes]);

        let loaded = self.replies.trees().contains_key(story_id);
        if !loaded {
            self.load_replies(story_id).await?;
        }
        info!(story_id = %story_id, "watching replies");
        Ok(())
    }

    pub fn unwatch_replies(&self, story_id: &str) {
        let removed = self.watches.lock().unwrap_or_else(|p| p.into_inner()).remove(story_id);
        for subscription in removed.iter().flatten() {
            subscription.dispose();
        }
    }

    /// Post a reply. It appears immediately under a temporary id and is
    /// swapped for the stored row once the server confirms it.
    pub async fn add_reply(
        &self,
        story_id: &str,
        parent_id: Option<&str>,
        content: &str,
    ) -> Result<Entity, SyncError> {
        let fields = row(serde_json::json!({
            "story_id": story_id,
            "parent_id": parent_id,
            "user_id": self.user_id,
            "content": content,
        }));
        let local = Entity::new(temp_id(), fields.clone());
        let local_id = local.id().to_string();

        let loaded = self.replies.trees().contains_key(story_id);
        if !loaded {
            self.load_replies(story_id).await?;
        }
        {
            let mut trees = self.replies.trees();
            let tree = trees.get_mut(story_id).ok_or(SyncError::Closed)?;
            if let InsertOutcome::NeedsRebuild { parent_id } = tree.insert(local) {
                return Err(SyncError::MissingEntity(parent_id));
            }
        }
        self.replies.notify(story_id);

        let result = self.store.insert(STORY_REPLIES_TABLE, fields).await;
        if self.replies.is_closed() {
            debug!(story_id = %story_id, "discarding late reply result");
            return result.map_err(SyncError::from).and_then(Entity::from_row);
        }

        match result.map_err(SyncError::from).and_then(Entity::from_row) {
            Ok(stored) => {
                if let Some(tree) = self.replies.trees().get_mut(story_id) {
                    tree.replace(&local_id, stored.clone());
                }
                self.replies.notify(story_id);
                Ok(stored)
            }
            Err(e) => {
                if let Some(tree) = self.replies.trees().get_mut(story_id) {
                    tree.remove(&local_id);
                }
                self.replies.notify(story_id);
                Err(self.replies.report(&local_id, MutationKind::Insert, e))
            }
        }
    }

    /// Delete a reply and everything under it. The subtree is restored if the
    /// server rejects the delete.
    pub async fn delete_reply(&self, reply_id: &str) -> Result<Vec<String>, SyncError> {
        let (story_id, position, snapshot) = {
            let trees = self.replies.trees();
            let found = trees.iter().find(|(_, tree)| tree.contains(reply_id)).map(|(story_id, tree)| {
                (
                    story_id.clone(),
                    tree.sibling_index(reply_id).unwrap_or_default(),
                    subtree(tree, reply_id),
                )
            });
            found.ok_or_else(|| SyncError::MissingEntity(reply_id.to_string()))?
        };

        let removed = match self.replies.trees().get_mut(&story_id) {
            Some(tree) => tree.remove(reply_id),
            None => Vec::new(),
        };
        self.replies.notify(&story_id);

        let stored: Vec<&str> = removed
            .iter()
            .map(String::as_str)
            .filter(|id| !is_temp_id(id))
            .collect();
        if stored.is_empty() {
            return Ok(removed);
        }

        let filter = Filter::new("id", FilterOp::In, stored.join(","));
        let result = self.store.delete(STORY_REPLIES_TABLE, &[filter]).await;
        if self.replies.is_closed() {
            return result.map(|_| removed).map_err(SyncError::from);
        }

        match result {
            Ok(()) => Ok(removed),
            Err(e) => {
                if let Some(tree) = self.replies.trees().get_mut(&story_id) {
                    let mut entities = snapshot.into_iter();
                    if let Some(top) = entities.next() {
                        tree.insert_at(top, position);
                    }
                    for entity in entities {
                        tree.insert(entity);
                    }
                }
                self.replies.notify(&story_id);
                Err(self.replies.report(reply_id, MutationKind::Delete, e.into()))
            }
        }
    }

    /// Dispose all reply watches and close the caches.
    pub fn stop(&self) {
        let watches: Vec<_> = self
            .watches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .flat_map(|(_, subs)| subs)
            .collect();
        for subscription in &watches {
            subscription.dispose();
        }
        self.replies
            .closed
            .store(true, Ordering::SeqCst);
        self.stories.close();
    }
}

impl Drop for Memories {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Entities of the subtree rooted at `id`, parents before children.
fn subtree(tree: &ReplyTree, id: &str) -> Vec<Entity> {
    let mut out = Vec::new();
    let mut stack = vec![id.to_string()];
    while let Some(current) = stack.pop() {
        if let Some(entity) = tree.get(&current) {
            out.push(entity.clone());
            stack.extend(tree.children_of(&current).iter().rev().cloned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_supabase::{MemoryRealtime, MemoryStore};
    use serde_json::json;

    fn reply(id: &str, parent: Option<&str>, at: &str) -> rally_supabase::Row {
        row(json!({
            "id": id,
            "story_id": "s1",
            "parent_id": parent,
            "content": id,
            "created_at": at
        }))
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryRealtime>, Memories) {
        let realtime = MemoryRealtime::new();
        let store = Arc::new(MemoryStore::new().with_feed(Arc::clone(&realtime)));
        store.seed(
            STORIES_TABLE,
            vec![
                row(json!({"id": "s1", "created_at": "2024-06-01T00:00:00Z"})),
                row(json!({"id": "s2", "created_at": "2024-06-02T00:00:00Z"})),
            ],
        );
        store.seed(
            STORY_REPLIES_TABLE,
            vec![
                reply("r1", None, "2024-06-01T01:00:00Z"),
                reply("r2", Some("r1"), "2024-06-01T02:00:00Z"),
                reply("r3", Some("r2"), "2024-06-01T03:00:00Z"),
            ],
        );
        let backend = Backend::new(store.clone(), realtime.clone());
        (store, realtime, Memories::new(&backend, "me"))
    }

    fn ids(nodes: &[ReplyNode]) -> Vec<String> {
        let mut out = Vec::new();
        for node in nodes {
            out.push(node.entity.id().to_string());
            out.extend(ids(&node.children));
        }
        out
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_load_stories_newest_first() {
        let (_store, _realtime, memories) = setup();
        assert_eq!(memories.load_stories().await.unwrap(), 2);
        let stories: Vec<_> = memories.stories().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(stories, ["s2", "s1"]);
    }

    #[tokio::test]
    async fn test_load_replies_builds_tree() {
        let (_store, _realtime, memories) = setup();
        let nested = memories.load_replies("s1").await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(ids(&nested), ["r1", "r2", "r3"]);
        assert_eq!(nested[0].children[0].children[0].entity.id(), "r3");
    }

    #[tokio::test]
    async fn test_live_reply_attaches_to_known_parent() {
        let (store, _realtime, memories) = setup();
        memories.watch_replies("s1").await.unwrap();
        let mut updates = memories.reply_updates();

        store
            .insert(STORY_REPLIES_TABLE, reply("r4", Some("r1"), "2024-06-01T04:00:00Z"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(updates.try_recv().unwrap(), "s1");
        let nested = memories.replies("s1");
        assert_eq!(nested[0].children.len(), 2);
        assert_eq!(ids(&nested), ["r1", "r2", "r3", "r4"]);
    }

    #[tokio::test]
    async fn test_live_reply_with_unknown_parent_rebuilds() {
        let (store, realtime, memories) = setup();
        memories.watch_replies("s1").await.unwrap();

        // The parent lands in the store but its event is lost.
        store.seed(STORY_REPLIES_TABLE, vec![reply("r5", Some("r3"), "2024-06-01T05:00:00Z")]);
        realtime.emit(ChangeEvent::insert(
            STORY_REPLIES_TABLE,
            reply("r6", Some("r5"), "2024-06-01T06:00:00Z"),
        ));
        store.seed(STORY_REPLIES_TABLE, vec![reply("r6", Some("r5"), "2024-06-01T06:00:00Z")]);
        settle().await;

        assert_eq!(ids(&memories.replies("s1")), ["r1", "r2", "r3", "r5", "r6"]);
    }

    #[tokio::test]
    async fn test_add_reply_swaps_temp_for_stored_row() {
        let (_store, _realtime, memories) = setup();
        memories.watch_replies("s1").await.unwrap();

        let stored = memories.add_reply("s1", Some("r3"), "nice").await.unwrap();
        settle().await;

        let all = ids(&memories.replies("s1"));
        assert_eq!(all.len(), 4);
        assert!(all.contains(&stored.id().to_string()));
        assert!(all.iter().all(|id| !is_temp_id(id)));
    }

    #[tokio::test]
    async fn test_add_reply_before_watch_keeps_existing_replies() {
        let (_store, _realtime, memories) = setup();

        let stored = memories.add_reply("s1", None, "hello").await.unwrap();
        memories.watch_replies("s1").await.unwrap();

        let all = ids(&memories.replies("s1"));
        assert_eq!(all.len(), 4);
        assert_eq!(all[..3], ["r1", "r2", "r3"]);
        assert_eq!(all[3], stored.id());
    }

    #[tokio::test]
    async fn test_add_reply_failure_removes_temp() {
        let (store, _realtime, memories) = setup();
        memories.load_replies("s1").await.unwrap();
        store.fail_next_writes(1);
        let mut failures = memories.failures();

        assert!(memories.add_reply("s1", None, "hello").await.is_err());
        assert_eq!(ids(&memories.replies("s1")), ["r1", "r2", "r3"]);
        assert_eq!(failures.try_recv().unwrap().kind, MutationKind::Insert);
    }

    #[tokio::test]
    async fn test_add_reply_to_unknown_parent() {
        let (_store, _realtime, memories) = setup();
        memories.load_replies("s1").await.unwrap();
        assert!(matches!(
            memories.add_reply("s1", Some("ghost"), "hi").await,
            Err(SyncError::MissingEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_reply_cascades_locally_and_remotely() {
        let (store, _realtime, memories) = setup();
        memories.watch_replies("s1").await.unwrap();

        let mut removed = memories.delete_reply("r2").await.unwrap();
        removed.sort();
        assert_eq!(removed, ["r2", "r3"]);
        settle().await;

        assert_eq!(ids(&memories.replies("s1")), ["r1"]);
        assert_eq!(store.rows(STORY_REPLIES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reply_failure_restores_subtree() {
        let (store, _realtime, memories) = setup();
        memories.load_replies("s1").await.unwrap();
        store.set_failing(true);

        assert!(memories.delete_reply("r2").await.is_err());
        assert_eq!(ids(&memories.replies("s1")), ["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_delete_reply_failure_keeps_sibling_order() {
        let (store, _realtime, memories) = setup();
        store.seed(STORY_REPLIES_TABLE, vec![reply("r4", Some("r1"), "2024-06-01T04:00:00Z")]);
        memories.load_replies("s1").await.unwrap();
        store.set_failing(true);

        assert!(memories.delete_reply("r2").await.is_err());
        let nested = memories.replies("s1");
        assert_eq!(ids(&nested), ["r1", "r2", "r3", "r4"]);
        assert_eq!(nested[0].children[0].entity.id(), "r2");
    }

    #[tokio::test]
    async fn test_stop_disposes_watches() {
        let (_store, realtime, memories) = setup();
        memories.watch_replies("s1").await.unwrap();
        assert_eq!(realtime.channel_count(), 2);

        memories.stop();
        assert_eq!(realtime.channel_count(), 0);
    }
}
