//! Error types for the Supabase client.

use thiserror::Error;

/// Errors that can occur when talking to the Supabase backend.
#[derive(Debug, Error)]
pub enum SupabaseError {
    /// Authentication failed or no session is available.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Row not found.
    #[error("row not found: {table}/{id}")]
    NotFound { table: String, id: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// PostgREST error body (`{code, message, details, hint}`).
    #[error("PostgREST error {code}: {message}")]
    Postgrest {
        /// HTTP status of the response.
        status: u16,
        code: String,
        message: String,
    },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Realtime protocol error (join refused, channel error).
    #[error("realtime error: {0}")]
    Realtime(String),

    /// Injected or simulated failure from an in-memory backend.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl SupabaseError {
    /// Whether the error is transient and the request is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SupabaseError::Http(e) => e.is_connect() || e.is_timeout(),
            SupabaseError::Postgrest { status, .. } => *status >= 500,
            SupabaseError::InvalidResponse(msg) => msg.starts_with("request failed (5"),
            _ => false,
        }
    }

    /// Whether the error indicates an expired or rejected access token.
    pub fn is_expired_token(&self) -> bool {
        match self {
            SupabaseError::Postgrest { status, code, .. } => code == "PGRST301" || *status == 401,
            _ => false,
        }
    }
}
