//! Realtime change-feed transport over Phoenix channels.
//!
//! One websocket carries every channel. Each channel subscribes to
//! `postgres_changes` for one table (and optional filter); row changes are
//! forwarded to the channel's event queue in arrival order.
//!
//! The socket is kept alive with a heartbeat on the `phoenix` topic. A
//! heartbeat that is still unanswered when the next one is due marks the
//! connection dead; the client then reconnects with exponential backoff and
//! rejoins all registered channels.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::{
    AuthClient, AuthEvent, ChangeEvent, ChangeKind, ChannelSpec, ChannelStatus, ConnectionState,
    Row, SupabaseError,
};

/// Topic used for socket-level heartbeats.
const PHOENIX_TOPIC: &str = "phoenix";

/// Protocol version requested from the server.
const PROTOCOL_VSN: &str = "1.0.0";

/// Change-feed transport consumed by the sync layer.
///
/// Opening a channel never fails synchronously: join failures are reported
/// through the handle's `status` receiver.
pub trait RealtimeTransport: Send + Sync {
    /// Register a channel and start joining it.
    fn open_channel(&self, spec: ChannelSpec) -> ChannelHandle;

    /// Leave and forget a channel. Unknown topics are ignored.
    fn remove_channel(&self, topic: &str);

    /// Health of the underlying connection.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Receiving side of an open channel.
#[derive(Debug)]
pub struct ChannelHandle {
    pub topic: String,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
    pub status: watch::Receiver<ChannelStatus>,
}

/// Realtime client configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Full websocket URL including `apikey` and `vsn` query parameters.
    pub url: String,
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RealtimeConfig {
    /// Derive the websocket endpoint from a project URL
    /// (`https://x.supabase.co` → `wss://x.supabase.co/realtime/v1/websocket`).
    pub fn from_project_url(project_url: &str, api_key: &str) -> Self {
        let base = project_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        Self {
            url: format!(
                "{}/realtime/v1/websocket?apikey={}&vsn={}",
                ws_base, api_key, PROTOCOL_VSN
            ),
            heartbeat_interval: Duration::from_secs(25),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Phoenix wire message (JSON serializer, vsn 1.0.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostgresChangesPayload {
    data: PostgresChange,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    table: String,
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

impl PostgresChange {
    fn into_event(self) -> ChangeEvent {
        let commit_timestamp = self
            .commit_timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        ChangeEvent {
            table: self.table,
            kind: self.kind,
            new: self.record.filter(|r| !r.is_empty()),
            old: self.old_record.filter(|r| !r.is_empty()),
            commit_timestamp,
        }
    }
}

/// Registered channel.
struct ChannelEntry {
    spec: ChannelSpec,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    status_tx: watch::Sender<ChannelStatus>,
}

/// Requests from the public API to the connection loop.
#[derive(Debug)]
enum Command {
    Join(String),
    Leave(String),
}

/// Per-connection bookkeeping.
#[derive(Default)]
struct ConnectionCtx {
    /// Topics joined on this socket.
    joined: HashSet<String>,
    /// Ref of the heartbeat still awaiting a reply.
    pending_heartbeat: Option<String>,
}

/// Realtime websocket client.
pub struct RealtimeClient {
    config: RealtimeConfig,
    auth: Option<AuthClient>,
    channels: DashMap<String, ChannelEntry>,
    /// Join ref per topic, to match join replies.
    join_refs: DashMap<String, String>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Mutex<mpsc::UnboundedReceiver<Command>>,
    state_tx: watch::Sender<ConnectionState>,
    next_ref: AtomicU64,
}

impl RealtimeClient {
    /// Create a client. Nothing connects until [`RealtimeClient::spawn`] or
    /// [`RealtimeClient::run`] is called.
    pub fn new(config: RealtimeConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Create a client that joins channels with the signed-in user's token.
    pub fn with_auth(config: RealtimeConfig, auth: AuthClient) -> Arc<Self> {
        Self::build(config, Some(auth))
    }

    fn build(config: RealtimeConfig, auth: Option<AuthClient>) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            config,
            auth,
            channels: DashMap::new(),
            join_refs: DashMap::new(),
            commands_tx,
            commands_rx: Mutex::new(commands_rx),
            state_tx,
            next_ref: AtomicU64::new(1),
        })
    }

    /// Spawn the connection loop on the current runtime.
    pub fn spawn(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.run(shutdown_rx).await {
                error!(error = %e, "realtime task failed");
            }
        })
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Connect and process messages, reconnecting with exponential backoff.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SupabaseError> {
        let mut commands = self.commands_rx.lock().await;
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: None, // Retry forever
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!(channels = self.channels.len(), "connecting to realtime");

            match self
                .connect_and_process(&mut commands, &mut shutdown_rx, &mut backoff)
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "realtime connection lost, reconnecting");
                    self.set_state(ConnectionState::Disconnected);

                    let wait = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        info!("realtime client shutting down");
        self.set_state(ConnectionState::Closed);
        for entry in self.channels.iter() {
            entry.status_tx.send_replace(ChannelStatus::Closed);
        }
        Ok(())
    }

    async fn connect_and_process(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), SupabaseError> {
        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| SupabaseError::WebSocket(format!("connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        info!("realtime connected");
        backoff.reset();

        let mut ctx = ConnectionCtx::default();
        let mut auth_events = self.auth.as_ref().map(AuthClient::on_auth_state_change);

        // Rejoin everything registered so far; queued joins become no-ops.
        let topics: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            if let Some(msg) = self.join_message(&topic).await? {
                send(&mut write, &msg).await?;
                ctx.joined.insert(topic);
            }
        }
        self.set_state(ConnectionState::Connected);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = write.close().await;
                        return Ok(());
                    }
                }

                _ = heartbeat.tick() => {
                    if ctx.pending_heartbeat.is_some() {
                        return Err(SupabaseError::WebSocket("heartbeat timeout".to_string()));
                    }
                    let msg_ref = self.make_ref();
                    send(&mut write, &PhoenixMessage {
                        topic: PHOENIX_TOPIC.to_string(),
                        event: "heartbeat".to_string(),
                        payload: json!({}),
                        msg_ref: Some(msg_ref.clone()),
                        join_ref: None,
                    }).await?;
                    trace!(msg_ref = %msg_ref, "heartbeat sent");
                    ctx.pending_heartbeat = Some(msg_ref);
                }

                Some(command) = commands.recv() => {
                    match command {
                        Command::Join(topic) => {
                            if ctx.joined.contains(&topic) {
                                continue;
                            }
                            if let Some(msg) = self.join_message(&topic).await? {
                                send(&mut write, &msg).await?;
                                ctx.joined.insert(topic);
                            }
                        }
                        Command::Leave(topic) => {
                            if ctx.joined.remove(&topic) {
                                send(&mut write, &PhoenixMessage {
                                    topic: topic.clone(),
                                    event: "phx_leave".to_string(),
                                    payload: json!({}),
                                    msg_ref: Some(self.make_ref()),
                                    join_ref: None,
                                }).await?;
                                debug!(topic = %topic, "left channel");
                            }
                        }
                    }
                }

                Some(event) = recv_auth(&mut auth_events) => {
                    if let AuthEvent::TokenRefreshed(session) = event {
                        for topic in &ctx.joined {
                            send(&mut write, &PhoenixMessage {
                                topic: topic.clone(),
                                event: "access_token".to_string(),
                                payload: json!({ "access_token": session.access_token }),
                                msg_ref: Some(self.make_ref()),
                                join_ref: None,
                            }).await?;
                        }
                        debug!(channels = ctx.joined.len(), "pushed refreshed access token");
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_text(&text, &mut ctx) {
                                warn!(error = %e, "failed to handle realtime message");
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite auto-responds to pings
                            trace!("received ping");
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(SupabaseError::WebSocket("connection closed".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(SupabaseError::WebSocket(format!("read error: {}", e)));
                        }
                        None => {
                            return Err(SupabaseError::WebSocket("stream ended".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Build the `phx_join` for a registered topic, or `None` if it was
    /// removed in the meantime.
    async fn join_message(&self, topic: &str) -> Result<Option<PhoenixMessage>, SupabaseError> {
        let Some(spec) = self.channels.get(topic).map(|e| e.spec.clone()) else {
            return Ok(None);
        };

        let mut change = json!({
            "event": spec.event.as_str(),
            "schema": spec.schema,
            "table": spec.table,
        });
        if let Some(filter) = &spec.filter {
            change["filter"] = json!(filter.to_string());
        }

        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            }
        });
        if let Some(auth) = &self.auth {
            payload["access_token"] = json!(auth.bearer().await?);
        }

        let join_ref = self.make_ref();
        self.join_refs.insert(topic.to_string(), join_ref.clone());
        if let Some(entry) = self.channels.get(topic) {
            entry.status_tx.send_replace(ChannelStatus::Joining);
        }
        debug!(topic = %topic, table = %spec.table, "joining channel");

        Ok(Some(PhoenixMessage {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload,
            msg_ref: Some(join_ref.clone()),
            join_ref: Some(join_ref),
        }))
    }

    /// Route one incoming message.
    fn handle_text(&self, text: &str, ctx: &mut ConnectionCtx) -> Result<(), SupabaseError> {
        let msg: PhoenixMessage = serde_json::from_str(text)?;

        if msg.topic == PHOENIX_TOPIC {
            if msg.event == "phx_reply" && msg.msg_ref.is_some() && msg.msg_ref == ctx.pending_heartbeat {
                trace!("heartbeat acknowledged");
                ctx.pending_heartbeat = None;
            }
            return Ok(());
        }

        match msg.event.as_str() {
            "phx_reply" => self.handle_reply(&msg),
            "postgres_changes" => {
                let payload: PostgresChangesPayload = serde_json::from_value(msg.payload)?;
                let event = payload.data.into_event();
                self.deliver(&msg.topic, event);
            }
            "system" => {
                let status = msg.payload.get("status").and_then(|s| s.as_str());
                if status == Some("error") {
                    let message = msg
                        .payload
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("channel error")
                        .to_string();
                    warn!(topic = %msg.topic, message = %message, "realtime system error");
                    self.set_channel_status(&msg.topic, ChannelStatus::Errored(message));
                } else {
                    trace!(topic = %msg.topic, "system message");
                }
            }
            "phx_error" => {
                warn!(topic = %msg.topic, "channel errored");
                ctx.joined.remove(&msg.topic);
                self.set_channel_status(&msg.topic, ChannelStatus::Errored("channel error".into()));
            }
            "phx_close" => {
                debug!(topic = %msg.topic, "channel closed by server");
                ctx.joined.remove(&msg.topic);
                self.set_channel_status(&msg.topic, ChannelStatus::Closed);
            }
            other => {
                trace!(topic = %msg.topic, event = %other, "ignoring realtime event");
            }
        }

        Ok(())
    }

    fn handle_reply(&self, msg: &PhoenixMessage) {
        let is_join_reply = match (self.join_refs.get(&msg.topic), &msg.msg_ref) {
            (Some(expected), Some(actual)) => expected.value() == actual,
            _ => false,
        };
        if !is_join_reply {
            return;
        }

        let status = msg.payload.get("status").and_then(|s| s.as_str());
        if status == Some("ok") {
            debug!(topic = %msg.topic, "channel joined");
            self.set_channel_status(&msg.topic, ChannelStatus::Joined);
        } else {
            let reason = msg
                .payload
                .get("response")
                .map(|r| r.to_string())
                .unwrap_or_else(|| "join refused".to_string());
            warn!(topic = %msg.topic, reason = %reason, "channel join refused");
            self.set_channel_status(&msg.topic, ChannelStatus::Errored(reason));
        }
    }

    fn deliver(&self, topic: &str, event: ChangeEvent) {
        let Some(entry) = self.channels.get(topic) else {
            trace!(topic = %topic, "change for unknown channel");
            return;
        };
        trace!(topic = %topic, table = %event.table, kind = %event.kind, "change received");
        if entry.events_tx.send(event).is_err() {
            trace!(topic = %topic, "channel receiver dropped");
        }
    }

    fn set_channel_status(&self, topic: &str, status: ChannelStatus) {
        if let Some(entry) = self.channels.get(topic) {
            entry.status_tx.send_replace(status);
        }
    }
}

impl RealtimeTransport for RealtimeClient {
    fn open_channel(&self, spec: ChannelSpec) -> ChannelHandle {
        let topic = format!("realtime:{}:{}", spec.table, uuid::Uuid::new_v4().simple());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ChannelStatus::Joining);

        self.channels.insert(
            topic.clone(),
            ChannelEntry {
                spec,
                events_tx,
                status_tx,
            },
        );
        if self.commands_tx.send(Command::Join(topic.clone())).is_err() {
            trace!(topic = %topic, "realtime loop not running");
        }

        ChannelHandle {
            topic,
            events,
            status,
        }
    }

    fn remove_channel(&self, topic: &str) {
        self.join_refs.remove(topic);
        if let Some((_, entry)) = self.channels.remove(topic) {
            entry.status_tx.send_replace(ChannelStatus::Closed);
            if self.commands_tx.send(Command::Leave(topic.to_string())).is_err() {
                trace!(topic = %topic, "realtime loop not running");
            }
        }
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

async fn send<S>(write: &mut S, msg: &PhoenixMessage) -> Result<(), SupabaseError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(msg)?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| SupabaseError::WebSocket(format!("send failed: {}", e)))
}

async fn recv_auth(rx: &mut Option<broadcast::Receiver<AuthEvent>>) -> Option<AuthEvent> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}
