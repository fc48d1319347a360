//! Catalog types
//!
//! Stream identity, discovered streams and the configured catalog a sync runs against.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Stream Identifier
// ============================================================================

/// (namespace, name) pair identifying a stream; unique across a catalog
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamIdentifier {
    /// Namespace (schema) the stream lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Stream (table) name
    pub name: String,
}

impl StreamIdentifier {
    /// Create a namespaced identifier
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Create an identifier without a namespace
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Parse `namespace.name` (or a bare `name`)
    pub fn parse(value: &str) -> Self {
        match value.split_once('.') {
            Some((namespace, name)) if !namespace.is_empty() => Self::new(namespace, name),
            _ => Self::unqualified(value),
        }
    }
}

impl fmt::Display for StreamIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ============================================================================
// Sync Modes
// ============================================================================

/// Synchronization mode supported by a discovered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full refresh - read everything every time
    #[default]
    FullRefresh,
    /// Incremental - only read what changed since the last sync
    Incremental,
}

/// Where an incremental stream's cursor comes from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CursorSpec {
    /// The source decides (replication position in CDC mode)
    #[default]
    SourceDefined,
    /// A user-selected field path in the record
    Field(Vec<String>),
}

impl CursorSpec {
    /// Whether the cursor is chosen by the source
    pub fn is_source_defined(&self) -> bool {
        matches!(self, CursorSpec::SourceDefined)
    }

    /// Field path, if user-defined
    pub fn field(&self) -> Option<&[String]> {
        match self {
            CursorSpec::SourceDefined => None,
            CursorSpec::Field(path) => Some(path),
        }
    }
}

/// Requested read behaviour for a configured stream
///
/// A source-defined incremental stream cannot carry a user cursor field: the
/// two are separate variants of [`CursorSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfiguredSyncMode {
    /// Read the full contents every sync
    FullRefresh,
    /// Read only changes after the saved position or cursor
    Incremental {
        /// Cursor definition
        cursor: CursorSpec,
    },
}

impl ConfiguredSyncMode {
    /// The plain sync mode
    pub fn sync_mode(&self) -> SyncMode {
        match self {
            ConfiguredSyncMode::FullRefresh => SyncMode::FullRefresh,
            ConfiguredSyncMode::Incremental { .. } => SyncMode::Incremental,
        }
    }
}

// ============================================================================
// Discovered Catalog
// ============================================================================

/// Catalog of streams available at the source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Available streams
    pub streams: Vec<CatalogStream>,
}

/// Stream in the discovered catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogStream {
    /// Namespace (schema)
    #[serde(default)]
    pub namespace: Option<String>,

    /// Stream name
    pub name: String,

    /// JSON schema for the stream
    #[serde(default)]
    pub json_schema: serde_json::Value,

    /// Supported sync modes
    #[serde(default)]
    pub supported_sync_modes: Vec<SyncMode>,

    /// Whether the source dictates the cursor (users cannot override it)
    #[serde(default)]
    pub source_defined_cursor: bool,

    /// Default cursor field
    #[serde(default)]
    pub default_cursor_field: Option<Vec<String>>,

    /// Source-defined primary key
    #[serde(default)]
    pub source_defined_primary_key: Vec<Vec<String>>,
}

impl CatalogStream {
    /// Identifier of this stream
    pub fn id(&self) -> StreamIdentifier {
        StreamIdentifier {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Whether the stream supports a sync mode
    pub fn supports(&self, mode: SyncMode) -> bool {
        self.supported_sync_modes.contains(&mode)
    }
}

// ============================================================================
// Configured Catalog
// ============================================================================

/// Configured catalog (selected streams for sync)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    /// Selected streams, in sync order
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Create a catalog from configured streams
    pub fn new(streams: Vec<ConfiguredStream>) -> Self {
        Self { streams }
    }

    /// All stream identifiers
    pub fn ids(&self) -> BTreeSet<StreamIdentifier> {
        self.streams.iter().map(|s| s.stream.clone()).collect()
    }

    /// Identifiers of incremental streams
    pub fn incremental_ids(&self) -> BTreeSet<StreamIdentifier> {
        self.streams
            .iter()
            .filter(|s| s.is_incremental())
            .map(|s| s.stream.clone())
            .collect()
    }

    /// Find a configured stream
    pub fn get(&self, id: &StreamIdentifier) -> Option<&ConfiguredStream> {
        self.streams.iter().find(|s| &s.stream == id)
    }

    /// Keep only the named streams (order preserved)
    #[must_use]
    pub fn select(mut self, names: &[StreamIdentifier]) -> Self {
        self.streams.retain(|s| names.contains(&s.stream));
        self
    }
}

/// Configured stream for sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConfiguredStream", into = "RawConfiguredStream")]
pub struct ConfiguredStream {
    /// Stream reference
    pub stream: StreamIdentifier,

    /// Selected sync mode and cursor
    pub mode: ConfiguredSyncMode,

    /// Primary key to use
    pub primary_key: Vec<Vec<String>>,
}

impl ConfiguredStream {
    /// Full refresh stream
    pub fn full_refresh(stream: StreamIdentifier) -> Self {
        Self {
            stream,
            mode: ConfiguredSyncMode::FullRefresh,
            primary_key: Vec::new(),
        }
    }

    /// Incremental stream with a source-defined cursor
    pub fn incremental(stream: StreamIdentifier) -> Self {
        Self {
            stream,
            mode: ConfiguredSyncMode::Incremental {
                cursor: CursorSpec::SourceDefined,
            },
            primary_key: Vec::new(),
        }
    }

    /// Incremental stream with a user-defined cursor field
    pub fn incremental_by(stream: StreamIdentifier, cursor_field: &[&str]) -> Self {
        Self {
            stream,
            mode: ConfiguredSyncMode::Incremental {
                cursor: CursorSpec::Field(cursor_field.iter().map(ToString::to_string).collect()),
            },
            primary_key: Vec::new(),
        }
    }

    /// Set the primary key
    #[must_use]
    pub fn with_primary_key(mut self, key: Vec<Vec<String>>) -> Self {
        self.primary_key = key;
        self
    }

    /// Whether the stream syncs incrementally
    pub fn is_incremental(&self) -> bool {
        matches!(self.mode, ConfiguredSyncMode::Incremental { .. })
    }

    /// User cursor field, if any
    pub fn cursor_field(&self) -> Option<&[String]> {
        match &self.mode {
            ConfiguredSyncMode::Incremental { cursor } => cursor.field(),
            ConfiguredSyncMode::FullRefresh => None,
        }
    }
}

/// Wire shape of a configured stream
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfiguredStream {
    stream: StreamIdentifier,
    #[serde(default)]
    sync_mode: SyncMode,
    #[serde(default)]
    source_defined_cursor: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor_field: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    primary_key: Vec<Vec<String>>,
}

impl TryFrom<RawConfiguredStream> for ConfiguredStream {
    type Error = Error;

    fn try_from(raw: RawConfiguredStream) -> Result<Self, Self::Error> {
        let cursor_field = raw.cursor_field.filter(|f| !f.is_empty());
        let mode = match raw.sync_mode {
            SyncMode::FullRefresh => ConfiguredSyncMode::FullRefresh,
            SyncMode::Incremental => match (raw.source_defined_cursor, cursor_field) {
                (true, Some(field)) => {
                    return Err(Error::invalid_value(
                        "cursor_field",
                        format!(
                            "stream '{}' has a source-defined cursor; '{}' cannot override it",
                            raw.stream,
                            field.join(".")
                        ),
                    ))
                }
                (_, Some(field)) => ConfiguredSyncMode::Incremental {
                    cursor: CursorSpec::Field(field),
                },
                (_, None) => ConfiguredSyncMode::Incremental {
                    cursor: CursorSpec::SourceDefined,
                },
            },
        };

        Ok(Self {
            stream: raw.stream,
            mode,
            primary_key: raw.primary_key,
        })
    }
}

impl From<ConfiguredStream> for RawConfiguredStream {
    fn from(stream: ConfiguredStream) -> Self {
        let (sync_mode, source_defined_cursor, cursor_field) = match stream.mode {
            ConfiguredSyncMode::FullRefresh => (SyncMode::FullRefresh, false, None),
            ConfiguredSyncMode::Incremental {
                cursor: CursorSpec::SourceDefined,
            } => (SyncMode::Incremental, true, None),
            ConfiguredSyncMode::Incremental {
                cursor: CursorSpec::Field(field),
            } => (SyncMode::Incremental, false, Some(field)),
        };

        Self {
            stream: stream.stream,
            sync_mode,
            source_defined_cursor,
            cursor_field,
            primary_key: stream.primary_key,
        }
    }
}
