//! Rally: command-line client for the Rally backend
//!
//! Subcommands:
//! - `login` / `logout`: phone one-time-code sign in
//! - `tail`: print a table's live change events
//! - `like`: toggle a like on an event
//! - `replies`: print a story's reply thread

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod session;

use commands::Context;
use session::SessionStore;

#[derive(Parser)]
#[command(name = "rally")]
#[command(about = "Rally realtime client", long_about = None)]
struct Cli {
    /// Supabase project URL
    #[arg(long, env = "RALLY_SUPABASE_URL", global = true)]
    url: Option<String>,

    /// Project anon key
    #[arg(long, env = "RALLY_SUPABASE_ANON_KEY", global = true, hide_env_values = true)]
    anon_key: Option<String>,

    /// Where the signed-in session is stored
    #[arg(long, env = "RALLY_SESSION_FILE", global = true)]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a one-time code sent by SMS
    Login {
        /// Phone number in E.164 form
        #[arg(long)]
        phone: String,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Print change events for a table until interrupted
    Tail {
        /// Table name
        table: String,

        /// Row filter, e.g. `user_id=eq.abc`
        #[arg(long)]
        filter: Option<String>,
    },

    /// Toggle your like on an event
    Like {
        /// Event id
        event_id: String,
    },

    /// Print the reply thread under a story
    Replies {
        /// Story id
        story_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rally=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let url = cli
        .url
        .ok_or_else(|| miette::miette!("missing project URL (--url or RALLY_SUPABASE_URL)"))?;
    let anon_key = cli
        .anon_key
        .ok_or_else(|| miette::miette!("missing anon key (--anon-key or RALLY_SUPABASE_ANON_KEY)"))?;
    let sessions = SessionStore::new(cli.session_file.unwrap_or_else(SessionStore::default_path));
    let ctx = Context::new(&url, &anon_key, sessions)?;

    match cli.command {
        Commands::Login { phone } => commands::login(&ctx, &phone).await,
        Commands::Logout => commands::logout(&ctx).await,
        Commands::Tail { table, filter } => commands::tail(&ctx, &table, filter.as_deref()).await,
        Commands::Like { event_id } => commands::like(&ctx, &event_id).await,
        Commands::Replies { story_id } => commands::replies(&ctx, &story_id).await,
    }
}
