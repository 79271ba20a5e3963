//! Typed change-feed subscriptions.
//!
//! [`ChangeFeed`] opens one transport channel per [`subscribe`](ChangeFeed::subscribe)
//! call and runs a dispatch task that hands each event to the supplied
//! [`ChangeHandlers`] in transport order. The returned [`Subscription`] is the
//! only way to stop it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rally_supabase::{
    ChangeEvent, ChangeKind, ChannelSpec, ChannelStatus, ConnectionState, Filter,
    RealtimeTransport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Handler = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Callbacks for a subscription. Any subset may be supplied.
///
/// `on_change` runs for every event, before the kind-specific handler.
#[derive(Default)]
pub struct ChangeHandlers {
    on_change: Option<Handler>,
    on_insert: Option<Handler>,
    on_update: Option<Handler>,
    on_delete: Option<Handler>,
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_change(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Box::new(handler));
        self
    }

    pub fn on_insert(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Box::new(handler));
        self
    }

    pub fn on_update(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(handler));
        self
    }

    pub fn on_delete(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(handler));
        self
    }

    fn dispatch(&self, event: &ChangeEvent) {
        if let Some(handler) = &self.on_change {
            handler(event);
        }
        let typed = match event.kind {
            ChangeKind::Insert => &self.on_insert,
            ChangeKind::Update => &self.on_update,
            ChangeKind::Delete => &self.on_delete,
        };
        if let Some(handler) = typed {
            handler(event);
        }
    }
}

impl fmt::Debug for ChangeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHandlers")
            .field("on_change", &self.on_change.is_some())
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

/// Entry point for table subscriptions over a realtime transport.
#[derive(Clone)]
pub struct ChangeFeed {
    transport: Arc<dyn RealtimeTransport>,
}

impl ChangeFeed {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self { transport }
    }

    /// Subscribe to every change on `table`, optionally narrowed by `filter`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        table: &str,
        filter: Option<Filter>,
        handlers: ChangeHandlers,
    ) -> Subscription {
        self.subscribe_spec(ChannelSpec::table(table).with_filter(filter), handlers)
    }

    /// Subscribe with a fully specified channel.
    pub fn subscribe_spec(&self, spec: ChannelSpec, handlers: ChangeHandlers) -> Subscription {
        let table = spec.table.clone();
        let handle = self.transport.open_channel(spec);
        let topic = handle.topic;

        let shared = Arc::new(Gate {
            active: AtomicBool::new(true),
            lock: Mutex::new(()),
        });
        let task = tokio::spawn(dispatch(
            handle.events,
            handlers,
            Arc::clone(&shared),
            topic.clone(),
        ));

        debug!(table = %table, topic = %topic, "subscribed to change feed");

        Subscription {
            topic,
            table,
            transport: Arc::clone(&self.transport),
            gate: shared,
            task: Mutex::new(Some(task)),
            status: handle.status,
            connection: self.transport.connection_state(),
        }
    }

    /// Health of the shared transport connection.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.connection_state()
    }
}

/// Serializes handler invocation against disposal.
struct Gate {
    active: AtomicBool,
    lock: Mutex<()>,
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    handlers: ChangeHandlers,
    gate: Arc<Gate>,
    topic: String,
) {
    while let Some(event) = events.recv().await {
        let _held = gate.lock.lock().unwrap_or_else(|p| p.into_inner());
        if !gate.active.load(Ordering::SeqCst) {
            break;
        }
        trace!(topic = %topic, kind = %event.kind, "dispatching change event");
        handlers.dispatch(&event);
    }
    trace!(topic = %topic, "dispatch task finished");
}

/// Handle for an active subscription.
///
/// Dropping it disposes the subscription.
pub struct Subscription {
    topic: String,
    table: String,
    transport: Arc<dyn RealtimeTransport>,
    gate: Arc<Gate>,
    task: Mutex<Option<JoinHandle<()>>>,
    status: watch::Receiver<ChannelStatus>,
    connection: watch::Receiver<ConnectionState>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_active(&self) -> bool {
        self.gate.active.load(Ordering::SeqCst)
    }

    /// Channel join status.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Transport connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Wait until the channel leaves `Joining`.
    pub async fn ready(&self) -> ChannelStatus {
        let mut status = self.status.clone();
        match status.wait_for(|s| *s != ChannelStatus::Joining).await {
            Ok(status) => status.clone(),
            Err(_) => ChannelStatus::Closed,
        }
    }

    /// Stop delivery and leave the channel.
    ///
    /// Once this returns no handler runs again, including for events already
    /// queued. Calling it again is a no-op. Must not be called from inside
    /// one of this subscription's own handlers.
    pub fn dispose(&self) {
        {
            let _held = self.gate.lock.lock().unwrap_or_else(|p| p.into_inner());
            if !self.gate.active.swap(false, Ordering::SeqCst) {
                return;
            }
        }

        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
        self.transport.remove_channel(&self.topic);
        debug!(table = %self.table, topic = %self.topic, "subscription disposed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("table", &self.table)
            .field("active", &self.is_active())
            .finish()
    }
}
