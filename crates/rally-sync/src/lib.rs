//! Realtime sync and optimistic updates for Rally.
//!
//! Keeps in-memory caches of backend rows consistent with the server's
//! change feed while applying local writes before the server confirms them.
//!
//! ## Layers
//!
//! - [`feed`]: typed callbacks over a realtime channel ([`ChangeFeed`])
//! - [`cache`]: per-table entity cache with update broadcast ([`EntityCache`])
//! - [`optimistic`]: apply-then-confirm writes with field-scoped revert
//!   ([`MutationCoordinator`])
//! - [`tree`]: parent/child reconciliation for threaded replies ([`ReplyTree`])
//!
//! [`activities`], [`interactions`] and [`memories`] wire these together for
//! the app's screens.

pub mod activities;
pub mod cache;
mod entity;
mod error;
pub mod feed;
pub mod interactions;
pub mod memories;
pub mod optimistic;
pub mod tree;

use std::sync::Arc;

use rally_supabase::{DataStore, RealtimeTransport};

pub use activities::ActivityFeed;
pub use cache::{CacheUpdate, EntityCache, SortOrder, SyncState};
pub use entity::{Entity, FieldSnapshot, row};
pub use error::SyncError;
pub use feed::{ChangeFeed, ChangeHandlers, Subscription};
pub use interactions::{EventInteractions, LikeState};
pub use memories::Memories;
pub use optimistic::{MutationCoordinator, MutationFailure, MutationKind, OptimisticRecord};
pub use tree::{InsertOutcome, ReplyNode, ReplyTree};

/// Backend handles shared by the consumers.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn DataStore>,
    pub feed: ChangeFeed,
}

impl Backend {
    pub fn new(store: Arc<dyn DataStore>, transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            store,
            feed: ChangeFeed::new(transport),
        }
    }
}
