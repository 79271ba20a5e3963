//! Persisted auth session.
//!
//! The session lives in a JSON file readable only by its owner, so a login
//! survives between invocations.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rally_supabase::Session;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported session file version {0}")]
    Version(u32),
}

const FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    version: u32,
    saved_at: i64,
    session: Session,
}

/// Reads and writes the session file at one path.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rally")
            .join("session.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored session. A missing file means signed out.
    pub async fn load(&self) -> Result<Option<Session>, SessionError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).await?;
        let file: SessionFile = serde_json::from_str(&content)?;
        if file.version != FILE_VERSION {
            return Err(SessionError::Version(file.version));
        }
        Ok(Some(file.session))
    }

    /// Write the session, replacing any previous one atomically.
    pub async fn save(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&SessionFile {
            version: FILE_VERSION,
            saved_at: Utc::now().timestamp(),
            session: session.clone(),
        })?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().await?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms).await?;
        }

        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Delete the stored session. Returns false if there was none.
    pub async fn clear(&self) -> Result<bool, SessionError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
