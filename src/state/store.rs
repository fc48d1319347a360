//! File-based state persistence
//!
//! Stores the latest checkpoint as pretty JSON with atomic writes.

use super::types::SyncState;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Persists the latest checkpointed `SyncState` to a file
#[derive(Debug, Clone)]
pub struct StateStore {
    /// Path to the state file
    path: PathBuf,
}

impl StateStore {
    /// Create a store for the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the state file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a state from inline JSON
    pub fn from_json(json: &str) -> Result<SyncState> {
        serde_json::from_str(json).map_err(|e| Error::State {
            message: format!("Failed to parse state JSON: {e}"),
        })
    }

    /// Load the saved state, `None` if no state file exists
    pub async fn load(&self) -> Result<Option<SyncState>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to read state file: {e}"),
            })?;

        if contents.trim().is_empty() {
            return Ok(None);
        }

        let state = serde_json::from_str(&contents).map_err(|e| Error::State {
            message: format!("Failed to parse state file: {e}"),
        })?;

        Ok(Some(state))
    }

    /// Save a state
    pub async fn save(&self, state: &SyncState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state).map_err(|e| Error::State {
            message: format!("Failed to serialize state: {e}"),
        })?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to write state file: {e}"),
            })?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::State {
                message: format!("Failed to rename state file: {e}"),
            })?;

        Ok(())
    }

    /// Remove the saved state (explicit external reset)
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::State {
                message: format!("Failed to remove state file: {e}"),
            }),
        }
    }
}
