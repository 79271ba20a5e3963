//! Optimistic mutations against an [`EntityCache`].
//!
//! Each operation applies its change to the cache immediately, awaits the
//! remote write, and either keeps the change or restores the touched fields
//! to their captured values. Mutations on the same `entity:field` key are
//! serialized: a second call waits for the first to resolve and then reads
//! the latest cache state.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use rally_supabase::{Row, SupabaseError};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, warn};

use crate::cache::UpdateOutcome;
use crate::{Entity, EntityCache, FieldSnapshot, SyncError};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Prefix of ids assigned to optimistic inserts.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Fresh id for an optimistic insert.
pub fn temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        })
    }
}

/// State captured for one in-flight mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticRecord {
    pub entity_id: String,
    pub kind: MutationKind,
    /// The whole entity before the mutation, if it was cached.
    pub previous: Option<Entity>,
    /// Prior values of the fields an update touched.
    pub snapshot: FieldSnapshot,
}

/// Reported on the failure channel when a remote write is rejected and the
/// cache has been reverted.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationFailure {
    pub table: String,
    pub entity_id: String,
    pub kind: MutationKind,
    /// Short message suitable for showing to the user.
    pub message: String,
}

/// Applies optimistic writes to one cache.
pub struct MutationCoordinator {
    cache: Arc<EntityCache>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    in_flight: DashMap<String, OptimisticRecord>,
    failures_tx: broadcast::Sender<MutationFailure>,
}

/// Holds the per-key locks for one mutation and releases them on drop.
struct KeyGuard<'a> {
    coordinator: &'a MutationCoordinator,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            self.coordinator.in_flight.remove(key);
        }
        self.guards.clear();
        for key in &self.keys {
            self.coordinator
                .locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

fn lock_key(entity_id: &str, field: &str) -> String {
    format!("{}:{}", entity_id, field)
}

impl MutationCoordinator {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        let (failures_tx, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            cache,
            locks: DashMap::new(),
            in_flight: DashMap::new(),
            failures_tx,
        }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Subscribe to reverted-mutation reports.
    pub fn failures(&self) -> broadcast::Receiver<MutationFailure> {
        self.failures_tx.subscribe()
    }

    /// Whether a mutation on `entity_id`'s `field` is awaiting its remote result.
    pub fn is_in_flight(&self, entity_id: &str, field: &str) -> bool {
        self.in_flight.contains_key(&lock_key(entity_id, field))
    }

    async fn acquire(&self, entity_id: &str, fields: &[&str]) -> KeyGuard<'_> {
        let mut keys: Vec<String> = fields.iter().map(|f| lock_key(entity_id, f)).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
            guards.push(lock.lock_owned().await);
        }
        KeyGuard {
            coordinator: self,
            keys,
            guards,
        }
    }

    fn track(&self, guard: &KeyGuard<'_>, record: &OptimisticRecord) {
        for key in &guard.keys {
            self.in_flight.insert(key.clone(), record.clone());
        }
    }

    fn report(&self, record: &OptimisticRecord, error: SupabaseError) -> SyncError {
        let error = SyncError::from(error);
        warn!(
            table = %self.cache.table(),
            id = %record.entity_id,
            kind = %record.kind,
            error = %error,
            "remote write failed, reverted"
        );
        let failure = MutationFailure {
            table: self.cache.table().to_string(),
            entity_id: record.entity_id.clone(),
            kind: record.kind,
            message: error.user_message(),
        };
        if self.failures_tx.send(failure).is_err() {
            debug!("no subscribers for mutation failure");
        }
        error
    }

    /// Result arrived after the cache was closed: leave everything alone.
    fn discard<T>(&self, record: &OptimisticRecord, result: Result<T, SupabaseError>) -> Result<T, SyncError> {
        debug!(
            table = %self.cache.table(),
            id = %record.entity_id,
            kind = %record.kind,
            "discarding late mutation result"
        );
        result.map_err(SyncError::from)
    }

    /// Merge `patch` into the cached entity, then run `remote`.
    /// On failure the patched fields are restored to their prior values.
    pub async fn update<T, F, Fut>(&self, entity_id: &str, patch: Row, remote: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SupabaseError>>,
    {
        let fields: Vec<&str> = patch.keys().map(String::as_str).collect();
        let guard = self.acquire(entity_id, &fields).await;

        if self.cache.is_closed() {
            return Err(SyncError::Closed);
        }
        let previous = self
            .cache
            .get(entity_id)
            .ok_or_else(|| SyncError::MissingEntity(entity_id.to_string()))?;

        let record = OptimisticRecord {
            entity_id: entity_id.to_string(),
            kind: MutationKind::Update,
            snapshot: previous.snapshot(&fields),
            previous: Some(previous),
        };
        self.track(&guard, &record);
        self.cache.update(entity_id, &patch);

        let result = remote().await;
        if self.cache.is_closed() {
            return self.discard(&record, result);
        }

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.cache.modify(entity_id, |entity| entity.restore(&record.snapshot));
                Err(self.report(&record, e))
            }
        }
    }

    /// Flip a boolean `flag` and step `counter` with it, then run `remote`
    /// with the new flag value. Returns the new flag value.
    ///
    /// A missing flag reads as `false` and a missing counter as `0`. On
    /// failure both fields are restored exactly.
    pub async fn toggle<F, Fut>(
        &self,
        entity_id: &str,
        flag: &str,
        counter: Option<&str>,
        remote: F,
    ) -> Result<bool, SyncError>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<(), SupabaseError>>,
    {
        let mut fields = vec![flag];
        fields.extend(counter);
        let guard = self.acquire(entity_id, &fields).await;

        if self.cache.is_closed() {
            return Err(SyncError::Closed);
        }
        let previous = self
            .cache
            .get(entity_id)
            .ok_or_else(|| SyncError::MissingEntity(entity_id.to_string()))?;

        let current = previous.bool_field(flag).unwrap_or(false);
        let next = !current;
        let record = OptimisticRecord {
            entity_id: entity_id.to_string(),
            kind: MutationKind::Update,
            snapshot: previous.snapshot(&fields),
            previous: Some(previous),
        };
        self.track(&guard, &record);

        let outcome = self.cache.modify(entity_id, |entity| {
            entity.set(flag, next);
            if let Some(counter) = counter {
                let count = entity.i64_field(counter).unwrap_or(0);
                let stepped = if next { count + 1 } else { (count - 1).max(0) };
                entity.set(counter, stepped);
            }
            true
        });
        if outcome == UpdateOutcome::Missing {
            return Err(SyncError::MissingEntity(entity_id.to_string()));
        }
        debug!(table = %self.cache.table(), id = %entity_id, flag = %flag, value = next, "optimistic toggle");

        let result = remote(next).await;
        if self.cache.is_closed() {
            return self.discard(&record, result).map(|_| next);
        }

        match result {
            Ok(()) => Ok(next),
            Err(e) => {
                self.cache.modify(entity_id, |entity| entity.restore(&record.snapshot));
                Err(self.report(&record, e))
            }
        }
    }

    /// Insert `entity` (usually under a [`temp_id`]) and run `remote` with
    /// its fields. The row the server returns replaces the optimistic entity;
    /// on failure the optimistic entity is removed.
    pub async fn insert<F, Fut>(&self, entity: Entity, remote: F) -> Result<Entity, SyncError>
    where
        F: FnOnce(Row) -> Fut,
        Fut: Future<Output = Result<Row, SupabaseError>>,
    {
        if self.cache.is_closed() {
            return Err(SyncError::Closed);
        }
        let guard = self.acquire(entity.id(), &["*"]).await;
        let local_id = entity.id().to_string();
        let record = OptimisticRecord {
            entity_id: local_id.clone(),
            kind: MutationKind::Insert,
            previous: None,
            snapshot: Vec::new(),
        };
        self.track(&guard, &record);

        let fields = entity.fields().clone();
        self.cache.insert(entity);

        let result = remote(fields).await;
        if self.cache.is_closed() {
            return self.discard(&record, result).and_then(Entity::from_row);
        }

        match result.map_err(SyncError::from).and_then(Entity::from_row) {
            Ok(stored) => {
                self.cache.replace(&local_id, stored.clone());
                debug!(table = %self.cache.table(), temp_id = %local_id, id = %stored.id(), "optimistic insert confirmed");
                Ok(stored)
            }
            Err(SyncError::Backend(e)) => {
                self.cache.remove(&local_id);
                Err(self.report(&record, e))
            }
            Err(e) => {
                self.cache.remove(&local_id);
                warn!(table = %self.cache.table(), error = %e, "server returned an unusable row");
                Err(e)
            }
        }
    }

    /// Remove the cached entity, then run `remote`. On failure the entity is
    /// put back.
    pub async fn delete<F, Fut>(&self, entity_id: &str, remote: F) -> Result<Option<Entity>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SupabaseError>>,
    {
        let guard = self.acquire(entity_id, &["*"]).await;
        if self.cache.is_closed() {
            return Err(SyncError::Closed);
        }

        let previous = self.cache.remove(entity_id);
        let record = OptimisticRecord {
            entity_id: entity_id.to_string(),
            kind: MutationKind::Delete,
            previous,
            snapshot: Vec::new(),
        };
        self.track(&guard, &record);

        let result = remote().await;
        if self.cache.is_closed() {
            return self.discard(&record, result).map(|_| record.previous.clone());
        }

        match result {
            Ok(()) => Ok(record.previous.clone()),
            Err(e) => {
                if let Some(previous) = record.previous.clone() {
                    self.cache.insert(previous);
                }
                Err(self.report(&record, e))
            }
        }
    }
}

/// Patch row with a single field.
pub fn patch(field: &str, value: impl Into<Value>) -> Row {
    let mut row = Row::new();
    row.insert(field.to_string(), value.into());
    row
}
