//! Subcommand implementations.

use miette::{IntoDiagnostic, Result};
use rally_supabase::{ChangeEvent, ChannelStatus, Filter, Session, SupabaseClient};
use rally_sync::{Backend, ChangeHandlers, EventInteractions, Memories, ReplyNode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::session::SessionStore;

/// Project clients plus the on-disk session.
pub struct Context {
    pub client: SupabaseClient,
    pub sessions: SessionStore,
}

impl Context {
    pub fn new(url: &str, anon_key: &str, sessions: SessionStore) -> Result<Self> {
        let client = SupabaseClient::new(url, anon_key).map_err(|e| miette::miette!("{}", e))?;
        Ok(Self { client, sessions })
    }

    /// Install the stored session, refreshing and re-saving it if it expired.
    async fn restore(&self) -> Result<Option<Session>> {
        let Some(session) = self.sessions.load().await.into_diagnostic()? else {
            return Ok(None);
        };
        let auth = self.client.auth();
        auth.set_session(session.clone()).await;

        if !session.is_expired() {
            return Ok(Some(session));
        }
        info!("stored session expired, refreshing");
        let refreshed = auth
            .refresh_session()
            .await
            .map_err(|e| miette::miette!("session expired and refresh failed: {}", e))?;
        self.sessions.save(&refreshed).await.into_diagnostic()?;
        Ok(Some(refreshed))
    }

    async fn require_session(&self) -> Result<Session> {
        self.restore()
            .await?
            .ok_or_else(|| miette::miette!("not signed in, run `rally login --phone <number>` first"))
    }

    fn backend(&self) -> Backend {
        Backend::new(self.client.store(), self.client.realtime())
    }
}

pub async fn login(ctx: &Context, phone: &str) -> Result<()> {
    let auth = ctx.client.auth();
    auth.sign_in_with_otp(phone)
        .await
        .map_err(|e| miette::miette!("failed to request code: {}", e))?;

    println!("Enter the code sent to {}:", phone);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = lines
        .next_line()
        .await
        .into_diagnostic()?
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| miette::miette!("no code entered"))?;

    let session = auth
        .verify_otp(phone, &code)
        .await
        .map_err(|e| miette::miette!("failed to verify code: {}", e))?;
    ctx.sessions.save(&session).await.into_diagnostic()?;

    info!(user = %session.user.id, path = %ctx.sessions.path().display(), "signed in");
    println!("Signed in as {}", session.user.id);
    Ok(())
}

pub async fn logout(ctx: &Context) -> Result<()> {
    if let Some(session) = ctx.sessions.load().await.into_diagnostic()? {
        ctx.client.auth().set_session(session).await;
        if let Err(e) = ctx.client.auth().sign_out().await {
            warn!(error = %e, "server sign out failed, removing local session anyway");
        }
    }

    if ctx.sessions.clear().await.into_diagnostic()? {
        println!("Signed out");
    } else {
        println!("Not signed in");
    }
    Ok(())
}

/// Print change events for `table` until Ctrl-C.
pub async fn tail(ctx: &Context, table: &str, filter: Option<&str>) -> Result<()> {
    ctx.restore().await?;
    let filter = filter
        .map(|f| f.parse::<Filter>())
        .transpose()
        .map_err(|e| miette::miette!("invalid filter: {}", e))?;

    let realtime = ctx.client.realtime();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let realtime_handle = realtime.spawn(shutdown_rx);
    let backend = Backend::new(ctx.client.store(), realtime);

    let handlers = ChangeHandlers::new().on_change(|event| println!("{}", format_event(event)));
    let subscription = backend.feed.subscribe(table, filter, handlers);

    match subscription.ready().await {
        ChannelStatus::Joined => {
            info!(table = %table, topic = %subscription.topic(), "listening for changes");
            eprintln!("Listening on {} (Ctrl-C to stop)", subscription.topic());
        }
        ChannelStatus::Errored(reason) => {
            let _ = shutdown_tx.send(true);
            return Err(miette::miette!("subscription to {} failed: {}", table, reason));
        }
        status => {
            let _ = shutdown_tx.send(true);
            return Err(miette::miette!("subscription to {} ended: {:?}", table, status));
        }
    }

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!(table = %table, "stopping");

    subscription.dispose();
    let _ = shutdown_tx.send(true);
    let _ = realtime_handle.await;
    Ok(())
}

/// Toggle the signed-in user's like on an event.
pub async fn like(ctx: &Context, event_id: &str) -> Result<()> {
    let session = ctx.require_session().await?;
    let interactions = EventInteractions::new(&ctx.backend(), session.user.id);

    interactions
        .load(event_id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let liked = interactions
        .toggle_like(event_id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let count = interactions
        .like_state(event_id)
        .map(|state| state.likes_count)
        .unwrap_or_default();
    println!(
        "{} {} ({} like{})",
        if liked { "Liked" } else { "Unliked" },
        event_id,
        count,
        if count == 1 { "" } else { "s" }
    );
    Ok(())
}

/// Print the reply thread under a story.
pub async fn replies(ctx: &Context, story_id: &str) -> Result<()> {
    let session = ctx.require_session().await?;
    let memories = Memories::new(&ctx.backend(), session.user.id);

    let tree = memories
        .load_replies(story_id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    if tree.is_empty() {
        println!("No replies");
    } else {
        print!("{}", render_tree(&tree));
    }
    Ok(())
}

fn format_event(event: &ChangeEvent) -> String {
    let record = event
        .record()
        .map(|row| serde_json::to_string(row).unwrap_or_default())
        .unwrap_or_else(|| "{}".to_string());
    let at = event
        .commit_timestamp
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    format!("{} {} {} {}", at, event.kind, event.table, record)
}

fn render_tree(nodes: &[ReplyNode]) -> String {
    fn walk(nodes: &[ReplyNode], depth: usize, out: &mut String) {
        for node in nodes {
            let content = node.entity.str_field("content").unwrap_or("");
            out.push_str(&format!("{}- [{}] {}\n", "  ".repeat(depth), node.entity.id(), content));
            walk(&node.children, depth + 1, out);
        }
    }

    let mut out = String::new();
    walk(nodes, 0, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_sync::{ReplyTree, row};
    use serde_json::json;

    #[test]
    fn test_render_tree_indents_children() {
        let tree = ReplyTree::build(vec![
            rally_sync::Entity::from_row(row(json!({"id": "a", "content": "first"}))).unwrap(),
            rally_sync::Entity::from_row(row(json!({"id": "b", "parent_id": "a", "content": "reply"}))).unwrap(),
            rally_sync::Entity::from_row(row(json!({"id": "c", "content": "second"}))).unwrap(),
        ]);

        assert_eq!(
            render_tree(&tree.nested()),
            "- [a] first\n  - [b] reply\n- [c] second\n"
        );
    }

    #[test]
    fn test_format_event() {
        let event = ChangeEvent::delete("events", row(json!({"id": "e1"})));
        assert_eq!(format_event(&event), r#"- DELETE events {"id":"e1"}"#);
    }
}
