//! Error types for the sync layer.

use rally_supabase::SupabaseError;
use thiserror::Error;

/// Errors raised by the cache, coordinator and consumers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend rejected or failed a request.
    #[error(transparent)]
    Backend(#[from] SupabaseError),

    /// A row from the backend could not be turned into an entity.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// The target entity is not in the cache.
    #[error("entity not found: {0}")]
    MissingEntity(String),

    /// The owning cache was closed before the operation finished.
    #[error("cache closed")]
    Closed,
}

impl SyncError {
    /// Short human-readable message for display to the user.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Backend(SupabaseError::Http(_)) | SyncError::Backend(SupabaseError::Unavailable(_)) => {
                "Couldn't reach the server. Please try again.".to_string()
            }
            SyncError::Backend(SupabaseError::RateLimited { .. }) => {
                "Too many requests. Please wait a moment.".to_string()
            }
            SyncError::Backend(SupabaseError::Auth(_)) => {
                "Please sign in again.".to_string()
            }
            SyncError::Backend(SupabaseError::Postgrest { status: 401 | 403, .. }) => {
                "You don't have permission to do that.".to_string()
            }
            SyncError::MissingEntity(_) | SyncError::Backend(SupabaseError::NotFound { .. }) => {
                "That item no longer exists.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let auth = SyncError::Backend(SupabaseError::Auth("no session".into()));
        assert_eq!(auth.user_message(), "Please sign in again.");

        let missing = SyncError::MissingEntity("e1".into());
        assert_eq!(missing.user_message(), "That item no longer exists.");

        assert_eq!(
            SyncError::Closed.user_message(),
            "Something went wrong. Please try again."
        );
    }
}
