//! Error types for Solidafy CDC
//!
//! This module defines the error hierarchy for the entire crate.
//! All public APIs return `Result<T, Error>` where Error is defined here.
//!
//! Fatal errors carry the stream, position or phase that produced them so a
//! failed sync can be diagnosed from the error alone.

use crate::state::ReplicationPosition;
use std::fmt;
use thiserror::Error;

/// Phase of a sync an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Catalog/state validation before any phase starts
    Setup,
    /// Full historical read of one or more streams
    Snapshot,
    /// Change streaming from a replication position
    Streaming,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Snapshot => write!(f, "snapshot"),
            Phase::Streaming => write!(f, "streaming"),
        }
    }
}

/// The main error type for Solidafy CDC
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid config value for '{field}': {message}")]
    InvalidConfigValue { field: String, message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Sync Errors
    // ============================================================================
    #[error("Transient I/O error during {phase}: {message}")]
    TransientIo { phase: Phase, message: String },

    #[error("Replication position {position} is no longer available; a full re-snapshot is required")]
    PositionExpired { position: ReplicationPosition },

    #[error("Snapshot of stream '{stream}' failed: {message}")]
    SnapshotFailure { stream: String, message: String },

    #[error("Giving up on {phase} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        phase: Phase,
        attempts: u32,
        last_error: String,
    },

    #[error("Sync timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Change transport error at position {position}: {message}")]
    Transport {
        position: ReplicationPosition,
        message: String,
    },

    // ============================================================================
    // State Errors
    // ============================================================================
    #[error("State error: {message}")]
    State { message: String },

    #[error("Stream '{stream}' not found in catalog")]
    StreamNotFound { stream: String },

    // ============================================================================
    // Database Errors
    // ============================================================================
    #[error("Database error: {message}")]
    Database { message: String },

    // ============================================================================
    // I/O Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid config value error
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfigValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a transient I/O error
    pub fn transient(phase: Phase, message: impl Into<String>) -> Self {
        Self::TransientIo {
            phase,
            message: message.into(),
        }
    }

    /// Create a snapshot failure
    pub fn snapshot(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SnapshotFailure {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Whether the failed operation may succeed when restarted from the last checkpoint
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo { .. })
    }

    /// Whether this error requires a full re-snapshot to recover from
    pub fn requires_resnapshot(&self) -> bool {
        matches!(self, Error::PositionExpired { .. })
    }
}

/// Result type alias for Solidafy CDC
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            Error::Other(format!("{}: {}", message.into(), inner))
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            Error::Other(format!("{}: {}", f(), inner))
        })
    }
}
