//! In-memory cache of backend rows for one entity table.
//!
//! Entities are keyed by id in a [`DashMap`] and read back in the configured
//! [`SortOrder`]. Every mutation is broadcast to subscribers as a
//! [`CacheUpdate`]. Change events that arrive while the initial fetch is in
//! flight are queued and replayed once the fetch has populated the cache.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rally_supabase::{ChangeEvent, ChangeKind, Row};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::{Entity, SyncError};

/// Maximum number of change events queued while syncing.
/// When exceeded, the oldest events are dropped.
pub const MAX_PENDING_EVENTS: usize = 10_000;

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// Synchronization state of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    /// Initial fetch not started.
    Disconnected = 0,
    /// Initial fetch in progress, change events being queued.
    Syncing = 1,
    /// Populated and applying change events as they arrive.
    Live = 2,
}

impl From<u8> for SyncState {
    fn from(v: u8) -> Self {
        match v {
            1 => SyncState::Syncing,
            2 => SyncState::Live,
            _ => SyncState::Disconnected,
        }
    }
}

/// Order in which [`EntityCache::list`] returns entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Newest `created_at` first. Entities without a timestamp (optimistic
    /// rows) lead.
    #[default]
    CreatedAtDesc,
    /// Oldest `created_at` first. Entities without a timestamp trail.
    CreatedAtAsc,
    /// Order of first insertion.
    Arrival,
}

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    Inserted { entity: Entity },
    Updated { entity: Entity },
    Removed { id: String },
    /// Contents replaced wholesale (initial fetch or clear).
    Reset,
    /// Cache is now live.
    Synchronized,
}

/// Result of [`EntityCache::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Changed,
    /// Patch matched the current fields; nothing was broadcast.
    Unchanged,
    /// No entity with that id.
    Missing,
}

/// What [`EntityCache::apply_change`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Unchanged,
    Removed,
    /// Held until the initial fetch completes.
    Queued,
    /// Nothing to do (absent id, closed cache, or partial row).
    Ignored,
}

#[derive(Debug, Clone)]
struct CachedEntity {
    entity: Entity,
    seq: u64,
}

/// Thread-safe entity cache for one table.
pub struct EntityCache {
    table: String,
    order: SortOrder,
    entries: DashMap<String, CachedEntity>,
    next_seq: AtomicU64,
    state: AtomicU8,
    closed: AtomicBool,
    pending_events: Mutex<VecDeque<ChangeEvent>>,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl EntityCache {
    /// Create an empty cache for `table`, newest first.
    pub fn new(table: impl Into<String>) -> Arc<Self> {
        Self::with_order(table, SortOrder::default())
    }

    pub fn with_order(table: impl Into<String>, order: SortOrder) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            table: table.into(),
            order,
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            state: AtomicU8::new(SyncState::Disconnected as u8),
            closed: AtomicBool::new(false),
            pending_events: Mutex::new(VecDeque::new()),
            updates_tx,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Get the current sync state.
    pub fn state(&self) -> SyncState {
        SyncState::from(self.state.load(Ordering::SeqCst))
    }

    /// Set the sync state. Going live notifies subscribers.
    pub fn set_state(&self, state: SyncState) {
        self.state.store(state as u8, Ordering::SeqCst);
        if state == SyncState::Live {
            self.broadcast(CacheUpdate::Synchronized);
        }
    }

    /// Subscribe to cache updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    /// Mark the cache disposed. Later mutations and events are ignored.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.lock_pending().clear();
            debug!(table = %self.table, "cache closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!(table = %self.table, "no subscribers for cache update");
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entries.get(id).map(|r| r.value().entity.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// All entities in sort order.
    pub fn list(&self) -> Vec<Entity> {
        let mut entries: Vec<CachedEntity> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        let order = self.order;
        entries.sort_by(|a, b| compare(order, a, b));
        entries.into_iter().map(|c| c.entity).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entity, or merge it into the existing one with the same id.
    pub fn insert(&self, entity: Entity) -> UpdateOutcome {
        self.upsert(entity, true)
    }

    fn upsert(&self, entity: Entity, notify: bool) -> UpdateOutcome {
        if self.is_closed() {
            return UpdateOutcome::Missing;
        }

        let id = entity.id().to_string();
        let (update, outcome) = match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get_mut();
                if cached.entity.merge(entity.fields()) {
                    (
                        Some(CacheUpdate::Updated {
                            entity: cached.entity.clone(),
                        }),
                        UpdateOutcome::Changed,
                    )
                } else {
                    (None, UpdateOutcome::Unchanged)
                }
            }
            Entry::Vacant(vacant) => {
                let seq = self.next_seq();
                vacant.insert(CachedEntity {
                    entity: entity.clone(),
                    seq,
                });
                (Some(CacheUpdate::Inserted { entity }), UpdateOutcome::Changed)
            }
        };

        if let Some(update) = update {
            trace!(table = %self.table, id = %id, "cache: entity upserted");
            if notify {
                self.broadcast(update);
            }
        }
        outcome
    }

    /// Shallow-merge `patch` into the entity with `id`.
    pub fn update(&self, id: &str, patch: &Row) -> UpdateOutcome {
        if self.is_closed() {
            return UpdateOutcome::Missing;
        }
        self.modify(id, |entity| entity.merge(patch))
    }

    /// Apply an arbitrary in-place edit. The closure returns whether it
    /// changed anything.
    pub fn modify(&self, id: &str, edit: impl FnOnce(&mut Entity) -> bool) -> UpdateOutcome {
        self.edit_entry(id, edit, true)
    }

    fn edit_entry(
        &self,
        id: &str,
        edit: impl FnOnce(&mut Entity) -> bool,
        notify: bool,
    ) -> UpdateOutcome {
        if self.is_closed() {
            return UpdateOutcome::Missing;
        }

        let updated = match self.entries.get_mut(id) {
            Some(mut cached) => {
                if edit(&mut cached.entity) {
                    Some(cached.entity.clone())
                } else {
                    None
                }
            }
            None => {
                debug!(table = %self.table, id = %id, "update for entity not in cache");
                return UpdateOutcome::Missing;
            }
        };

        match updated {
            Some(entity) => {
                trace!(table = %self.table, id = %id, "cache: entity updated");
                if notify {
                    self.broadcast(CacheUpdate::Updated { entity });
                }
                UpdateOutcome::Changed
            }
            None => UpdateOutcome::Unchanged,
        }
    }

    /// Remove an entity, returning it if present.
    pub fn remove(&self, id: &str) -> Option<Entity> {
        self.take(id, true)
    }

    fn take(&self, id: &str, notify: bool) -> Option<Entity> {
        if self.is_closed() {
            return None;
        }
        let (_, removed) = self.entries.remove(id)?;
        trace!(table = %self.table, id = %id, "cache: entity removed");
        if notify {
            self.broadcast(CacheUpdate::Removed { id: id.to_string() });
        }
        Some(removed.entity)
    }

    /// Swap the entity stored under `old_id` for `entity`, keeping its
    /// position. Used when a server row replaces an optimistic one.
    pub fn replace(&self, old_id: &str, entity: Entity) {
        if self.is_closed() {
            return;
        }
        if old_id == entity.id() {
            self.insert(entity);
            return;
        }

        let seq = match self.entries.remove(old_id) {
            Some((_, previous)) => {
                self.broadcast(CacheUpdate::Removed {
                    id: old_id.to_string(),
                });
                previous.seq
            }
            None => self.next_seq(),
        };

        // The server row may already have arrived through the change feed.
        match self.entries.entry(entity.id().to_string()) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get_mut();
                cached.entity.merge(entity.fields());
                let entity = cached.entity.clone();
                drop(occupied);
                self.broadcast(CacheUpdate::Updated { entity });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedEntity {
                    entity: entity.clone(),
                    seq,
                });
                self.broadcast(CacheUpdate::Inserted { entity });
            }
        }
        trace!(table = %self.table, old_id = %old_id, "cache: entity replaced");
    }

    /// Replace the contents with a freshly fetched list.
    pub fn replace_all(&self, entities: impl IntoIterator<Item = Entity>) {
        if self.is_closed() {
            return;
        }
        self.entries.clear();
        for entity in entities {
            let seq = self.next_seq();
            self.entries.insert(entity.id().to_string(), CachedEntity { entity, seq });
        }
        debug!(table = %self.table, count = self.entries.len(), "cache populated");
        self.broadcast(CacheUpdate::Reset);
    }

    /// Remove every entity.
    pub fn clear(&self) {
        self.entries.clear();
        self.broadcast(CacheUpdate::Reset);
    }

    /// Route a change event into the cache.
    ///
    /// While syncing, events are queued for [`finish_sync`](Self::finish_sync).
    /// An update for an absent entity is inserted when live and carrying a
    /// valid row; otherwise it is dropped.
    pub fn apply_change(&self, event: &ChangeEvent) -> Result<ApplyOutcome, SyncError> {
        if self.is_closed() {
            return Ok(ApplyOutcome::Ignored);
        }
        // Held until the event is applied, so sync transitions never
        // interleave with it.
        let mut queue = self.lock_pending();
        match self.state() {
            SyncState::Syncing => {
                self.push_pending(&mut queue, event.clone());
                Ok(ApplyOutcome::Queued)
            }
            SyncState::Live => self.apply_event(event, true, true),
            SyncState::Disconnected => self.apply_event(event, false, true),
        }
    }

    fn apply_event(
        &self,
        event: &ChangeEvent,
        live: bool,
        notify: bool,
    ) -> Result<ApplyOutcome, SyncError> {
        match event.kind {
            ChangeKind::Insert => {
                let row = event
                    .new
                    .clone()
                    .ok_or_else(|| SyncError::InvalidRow("insert without record".into()))?;
                let entity = Entity::from_row(row)?;
                Ok(match self.upsert(entity, notify) {
                    UpdateOutcome::Unchanged => ApplyOutcome::Unchanged,
                    UpdateOutcome::Missing => ApplyOutcome::Ignored,
                    UpdateOutcome::Changed => ApplyOutcome::Inserted,
                })
            }
            ChangeKind::Update => {
                let Some(new) = event.new.clone() else {
                    return Ok(ApplyOutcome::Ignored);
                };
                let entity = Entity::from_row(new)?;
                let outcome =
                    self.edit_entry(entity.id(), |current| current.merge(entity.fields()), notify);
                match outcome {
                    UpdateOutcome::Changed => Ok(ApplyOutcome::Updated),
                    UpdateOutcome::Unchanged => Ok(ApplyOutcome::Unchanged),
                    UpdateOutcome::Missing if live => {
                        debug!(table = %self.table, id = %entity.id(), "update for unseen entity, inserting");
                        self.upsert(entity, notify);
                        Ok(ApplyOutcome::Inserted)
                    }
                    UpdateOutcome::Missing => Ok(ApplyOutcome::Ignored),
                }
            }
            ChangeKind::Delete => {
                let id = event
                    .old
                    .as_ref()
                    .and_then(Entity::id_of)
                    .or_else(|| event.new.as_ref().and_then(Entity::id_of));
                match id {
                    Some(id) if self.take(&id, notify).is_some() => Ok(ApplyOutcome::Removed),
                    Some(id) => {
                        debug!(table = %self.table, id = %id, "delete for entity not in cache");
                        Ok(ApplyOutcome::Ignored)
                    }
                    None => {
                        warn!(table = %self.table, "delete event without id");
                        Ok(ApplyOutcome::Ignored)
                    }
                }
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<ChangeEvent>> {
        self.pending_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event received during the initial fetch.
    pub fn queue_event(&self, event: ChangeEvent) {
        let mut queue = self.lock_pending();
        self.push_pending(&mut queue, event);
    }

    fn push_pending(&self, queue: &mut VecDeque<ChangeEvent>, event: ChangeEvent) {
        while queue.len() >= MAX_PENDING_EVENTS {
            queue.pop_front();
            warn!(
                table = %self.table,
                max = MAX_PENDING_EVENTS,
                "pending events queue full, dropping oldest event"
            );
        }

        queue.push_back(event);

        let len = queue.len();
        if len >= 5000 {
            warn!(table = %self.table, queue_len = len, "pending events queue is very large");
        } else {
            trace!(table = %self.table, queue_len = len, "queued change event");
        }
    }

    /// Drain all queued events.
    pub fn drain_pending(&self) -> Vec<ChangeEvent> {
        let events: Vec<_> = self.lock_pending().drain(..).collect();
        if !events.is_empty() {
            debug!(table = %self.table, count = events.len(), "drained pending events for replay");
        }
        events
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Begin an initial fetch: discard stale queued events and start queueing.
    pub fn begin_sync(&self) {
        let mut queue = self.lock_pending();
        let stale = queue.len();
        queue.clear();
        if stale > 0 {
            debug!(table = %self.table, count = stale, "cleared stale pending events");
        }
        self.set_state(SyncState::Syncing);
    }

    /// Populate from the fetched rows, replay queued events and go live.
    ///
    /// Rows that fail validation are skipped with a warning. Change events
    /// arriving meanwhile wait for the switch to live and apply after the
    /// replay.
    pub fn finish_sync(&self, rows: Vec<Row>) {
        let entities = rows.into_iter().filter_map(|row| match Entity::from_row(row) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(table = %self.table, error = %e, "skipping invalid row");
                None
            }
        });

        let mut queue = self.lock_pending();
        self.replace_all(entities);

        let pending: Vec<ChangeEvent> = queue.drain(..).collect();
        debug!(
            table = %self.table,
            pending = pending.len(),
            "replaying pending change events"
        );
        // Subscribers re-read on Reset, so the replay itself is not broadcast.
        // The fetch is authoritative: updates for rows it excluded are dropped.
        for event in &pending {
            if let Err(e) = self.apply_event(event, false, false) {
                warn!(table = %self.table, error = %e, "failed to apply pending event");
            }
        }

        self.set_state(SyncState::Live);
    }

    /// Abandon an initial fetch, returning to `Disconnected`.
    pub fn abort_sync(&self) {
        let mut queue = self.lock_pending();
        let dropped = queue.len();
        queue.clear();
        self.set_state(SyncState::Disconnected);
        debug!(table = %self.table, dropped, "initial sync aborted");
    }
}

fn compare(order: SortOrder, a: &CachedEntity, b: &CachedEntity) -> CmpOrdering {
    match order {
        SortOrder::Arrival => a.seq.cmp(&b.seq),
        SortOrder::CreatedAtDesc => {
            match (a.entity.created_at(), b.entity.created_at()) {
                (Some(x), Some(y)) => y.cmp(&x),
                (None, Some(_)) => CmpOrdering::Less,
                (Some(_), None) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            }
            .then_with(|| b.seq.cmp(&a.seq))
        }
        SortOrder::CreatedAtAsc => {
            match (a.entity.created_at(), b.entity.created_at()) {
                (Some(x), Some(y)) => x.cmp(&y),
                (None, Some(_)) => CmpOrdering::Greater,
                (Some(_), None) => CmpOrdering::Less,
                (None, None) => CmpOrdering::Equal,
            }
            .then_with(|| a.seq.cmp(&b.seq))
        }
    }
}
