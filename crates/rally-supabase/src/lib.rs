//! Supabase client for Rally.
//!
//! This crate provides the three backend surfaces the sync layer consumes,
//! each behind a trait so the sync layer can be driven by test doubles.
//!
//! ## Features
//!
//! - **REST**: PostgREST query/write client ([`DataStore`], [`RestClient`])
//! - **Auth**: phone one-time-code sign-in and session refresh ([`AuthClient`])
//! - **Realtime**: Phoenix-channel `postgres_changes` feed with heartbeat
//!   and reconnect ([`RealtimeTransport`], [`RealtimeClient`])
//! - **Memory**: in-memory doubles for tests and offline runs

mod auth;
mod error;
pub mod memory;
pub mod realtime;
mod rest;
mod types;

use std::sync::Arc;

pub use auth::AuthClient;
pub use error::SupabaseError;
pub use memory::{MemoryRealtime, MemoryStore};
pub use realtime::{ChannelHandle, RealtimeClient, RealtimeConfig, RealtimeTransport};
pub use rest::{DataStore, RestClient};
pub use types::*;

/// Auth and REST clients for one project, sharing a session.
#[derive(Clone)]
pub struct SupabaseClient {
    url: String,
    auth: AuthClient,
    rest: RestClient,
}

impl SupabaseClient {
    /// Create clients for the project at `url` using its anon key.
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Result<Self, SupabaseError> {
        let url = url.into();
        let auth = AuthClient::new(url.clone(), anon_key)?;
        let rest = RestClient::new(url.clone(), auth.clone())?;
        Ok(Self { url, auth, rest })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// REST client as a shared [`DataStore`].
    pub fn store(&self) -> Arc<dyn DataStore> {
        Arc::new(self.rest.clone())
    }

    /// Realtime client joining channels with this project's session.
    pub fn realtime(&self) -> Arc<RealtimeClient> {
        let config = RealtimeConfig::from_project_url(&self.url, self.auth.anon_key());
        RealtimeClient::with_auth(config, self.auth.clone())
    }
}
