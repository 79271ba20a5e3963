//! In-memory backend doubles.
//!
//! [`MemoryStore`] implements [`DataStore`] over per-table row vectors and
//! [`MemoryRealtime`] implements [`RealtimeTransport`] with manual event
//! emission. Wiring a store to a feed with [`MemoryStore::with_feed`] echoes
//! every successful write as a change event, like the hosted backend does.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::{
    ChangeEvent, ChannelHandle, ChannelSpec, ChannelStatus, ConnectionState, DataStore, Filter,
    Query, RealtimeTransport, Row, SupabaseError, value_as_text,
};

/// In-memory relational store.
#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<String, Vec<Row>>,
    feed: Option<Arc<MemoryRealtime>>,
    latency: Option<Duration>,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo successful writes to a realtime double.
    pub fn with_feed(mut self, feed: Arc<MemoryRealtime>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Delay every call, to keep writes in flight during a test.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every write fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of write calls attempted (successful or not).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed rows without emitting change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        self.tables.entry(table.to_string()).or_default().extend(rows);
    }

    /// Snapshot of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.get(table).map(|t| t.clone()).unwrap_or_default()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_write(&self) -> Result<(), SupabaseError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SupabaseError::Unavailable("store is failing".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(SupabaseError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn echo(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.emit(event);
        }
    }
}

fn row_id(row: &Row) -> Option<String> {
    row.get("id").map(value_as_text)
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, SupabaseError> {
        self.delay().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(SupabaseError::Unavailable("store is failing".into()));
        }

        let mut rows: Vec<Row> = self
            .tables
            .get(&query.table)
            .map(|t| {
                t.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let a = a.get(&order.column).map(value_as_text).unwrap_or_default();
                let b = b.get(&order.column).map(value_as_text).unwrap_or_default();
                if order.ascending { a.cmp(&b) } else { b.cmp(&a) }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, SupabaseError> {
        self.delay().await;
        self.check_write()?;

        if !row.contains_key("id") {
            row.insert("id".into(), uuid::Uuid::new_v4().to_string().into());
        }
        if !row.contains_key("created_at") {
            row.insert("created_at".into(), Utc::now().to_rfc3339().into());
        }

        let id = row_id(&row).unwrap_or_default();
        {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            if rows.iter().any(|r| row_id(r).as_deref() == Some(id.as_str())) {
                return Err(SupabaseError::Postgrest {
                    status: 409,
                    code: "23505".into(),
                    message: format!("duplicate key value violates unique constraint on {}", table),
                });
            }
            rows.push(row.clone());
        }

        trace!(table = %table, id = %id, "memory insert");
        self.echo(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, SupabaseError> {
        self.delay().await;
        self.check_write()?;

        let updated = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            let row = rows
                .iter_mut()
                .find(|r| row_id(r).as_deref() == Some(id))
                .ok_or_else(|| SupabaseError::NotFound {
                    table: table.to_string(),
                    id: id.to_string(),
                })?;
            row.extend(patch);
            row.clone()
        };

        let mut old = Row::new();
        old.insert("id".into(), id.into());
        self.echo(ChangeEvent::update(table, updated.clone(), Some(old)));
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), SupabaseError> {
        self.delay().await;
        self.check_write()?;

        let removed: Vec<Row> = match self.tables.get_mut(table) {
            Some(mut rows) => {
                let (gone, kept): (Vec<Row>, Vec<Row>) = rows
                    .drain(..)
                    .partition(|row| filters.iter().all(|f| f.matches(row)));
                *rows = kept;
                gone
            }
            None => Vec::new(),
        };

        for row in removed {
            let mut old = Row::new();
            if let Some(id) = row.get("id") {
                old.insert("id".into(), id.clone());
            }
            self.echo(ChangeEvent::delete(table, old));
        }
        Ok(())
    }
}

struct MemoryChannel {
    spec: ChannelSpec,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    status_tx: watch::Sender<ChannelStatus>,
}

/// In-memory change feed.
pub struct MemoryRealtime {
    channels: DashMap<String, MemoryChannel>,
    state_tx: watch::Sender<ConnectionState>,
    refuse_joins: AtomicBool,
    next_topic: AtomicUsize,
}

impl Default for MemoryRealtime {
    fn default() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            channels: DashMap::new(),
            state_tx,
            refuse_joins: AtomicBool::new(false),
            next_topic: AtomicUsize::new(0),
        }
    }
}

impl MemoryRealtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an event to every channel whose spec accepts it.
    /// Returns the number of channels it was delivered to.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        for channel in self.channels.iter() {
            if *channel.status_tx.borrow() != ChannelStatus::Joined {
                continue;
            }
            if channel.spec.accepts(&event) && channel.events_tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Refuse subsequent joins, leaving their channels errored.
    pub fn refuse_joins(&self, refuse: bool) {
        self.refuse_joins.store(refuse, Ordering::SeqCst);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Topics of the open channels.
    pub fn topics(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }
}

impl RealtimeTransport for MemoryRealtime {
    fn open_channel(&self, spec: ChannelSpec) -> ChannelHandle {
        let n = self.next_topic.fetch_add(1, Ordering::SeqCst);
        let topic = format!("realtime:{}:{}", spec.table, n);
        let (events_tx, events) = mpsc::unbounded_channel();
        let initial = if self.refuse_joins.load(Ordering::SeqCst) {
            ChannelStatus::Errored("join refused".into())
        } else {
            ChannelStatus::Joined
        };
        let (status_tx, status) = watch::channel(initial);

        self.channels.insert(
            topic.clone(),
            MemoryChannel {
                spec,
                events_tx,
                status_tx,
            },
        );

        ChannelHandle {
            topic,
            events,
            status,
        }
    }

    fn remove_channel(&self, topic: &str) {
        if let Some((_, channel)) = self.channels.remove(topic) {
            channel.status_tx.send_replace(ChannelStatus::Closed);
        }
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_echoes() {
        let feed = MemoryRealtime::new();
        let store = MemoryStore::new().with_feed(Arc::clone(&feed));
        let mut handle = feed.open_channel(ChannelSpec::table("stories"));

        let stored = store.insert("stories", row(json!({"title": "hi"}))).await.unwrap();
        assert!(stored.contains_key("id"));
        assert!(stored.contains_key("created_at"));

        let event = handle.events.recv().await.unwrap();
        assert_eq!(event.new.unwrap()["id"], stored["id"]);
    }

    #[tokio::test]
    async fn test_select_filters_orders_limits() {
        let store = MemoryStore::new();
        store.seed(
            "activities",
            vec![
                row(json!({"id": "a1", "user_id": "u1", "created_at": "2024-01-01T00:00:00Z"})),
                row(json!({"id": "a2", "user_id": "u1", "created_at": "2024-01-03T00:00:00Z"})),
                row(json!({"id": "a3", "user_id": "u2", "created_at": "2024-01-02T00:00:00Z"})),
            ],
        );

        let rows = store
            .select(&Query::table("activities").eq("user_id", "u1").order_desc("created_at").limit(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "a2");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.insert("t", row(json!({"id": "1"}))).await.is_err());
        assert!(store.insert("t", row(json!({"id": "1"}))).await.is_ok());
        assert!(store.insert("t", row(json!({"id": "1"}))).await.is_err(), "duplicate id");
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_delete_by_filters_echoes_ids() {
        let feed = MemoryRealtime::new();
        let store = MemoryStore::new().with_feed(Arc::clone(&feed));
        store.seed(
            "event_likes",
            vec![
                row(json!({"id": "l1", "event_id": "e1", "user_id": "u1"})),
                row(json!({"id": "l2", "event_id": "e1", "user_id": "u2"})),
            ],
        );
        let mut handle = feed.open_channel(ChannelSpec::table("event_likes"));

        store
            .delete("event_likes", &[Filter::eq("event_id", "e1"), Filter::eq("user_id", "u1")])
            .await
            .unwrap();

        assert_eq!(store.rows("event_likes").len(), 1);
        let event = handle.events.recv().await.unwrap();
        assert_eq!(event.old.unwrap()["id"], "l1");
    }

    #[tokio::test]
    async fn test_refused_join_receives_nothing() {
        let feed = MemoryRealtime::new();
        feed.refuse_joins(true);
        let handle = feed.open_channel(ChannelSpec::table("stories"));
        assert!(matches!(*handle.status.borrow(), ChannelStatus::Errored(_)));
        assert_eq!(feed.emit(ChangeEvent::insert("stories", row(json!({"id": "s1"})))), 0);
    }
}
