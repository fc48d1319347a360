//! Source capability descriptor
//!
//! Source-specific behaviour (state mode, internal namespaces, cursor type
//! allow-list) is described by data handed to the core instead of being
//! spread over per-source code paths.

use super::types::{Catalog, CatalogStream, ConfiguredCatalog, SyncMode};
use crate::cdc::metadata::add_metadata_columns;
use crate::error::{Error, Result};
use crate::state::{StateMode, SyncState};
use crate::types::JsonValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Column as reported by schema discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Database type name (e.g. `TIMESTAMP`, `INTEGER`)
    pub data_type: String,
}

impl ColumnInfo {
    /// Create column info
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// What the source supports and how it should be treated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCapabilities {
    /// Global (shared replication position) or per-stream cursors
    #[serde(default)]
    pub state_mode: StateMode,

    /// Namespaces that are never synced
    #[serde(default)]
    pub excluded_namespaces: BTreeSet<String>,

    /// Column types usable as incremental cursors (upper-case type names)
    #[serde(default)]
    pub cursor_types: BTreeSet<String>,

    /// Whether records carry `_ab_cdc_*` metadata columns in global mode
    #[serde(default = "default_true")]
    pub inject_cdc_metadata: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SourceCapabilities {
    fn default() -> Self {
        Self {
            state_mode: StateMode::PerStream,
            excluded_namespaces: BTreeSet::new(),
            cursor_types: BTreeSet::new(),
            inject_cdc_metadata: true,
        }
    }
}

const POSTGRES_EXCLUDED_NAMESPACES: &[&str] = &[
    "information_schema",
    "pg_catalog",
    "pg_internal",
    "catalog_history",
];

const POSTGRES_CURSOR_TYPES: &[&str] = &[
    "TIMESTAMP",
    "TIMESTAMP_WITH_TIMEZONE",
    "TIME",
    "TIME_WITH_TIMEZONE",
    "DATE",
    "BIT",
    "BOOLEAN",
    "TINYINT",
    "SMALLINT",
    "INTEGER",
    "BIGINT",
    "FLOAT",
    "DOUBLE",
    "REAL",
    "NUMERIC",
    "DECIMAL",
    "CHAR",
    "NCHAR",
    "NVARCHAR",
    "VARCHAR",
    "LONGVARCHAR",
    "BINARY",
    "BLOB",
];

impl SourceCapabilities {
    /// Capabilities for a source in the given state mode
    pub fn new(state_mode: StateMode) -> Self {
        Self {
            state_mode,
            ..Self::default()
        }
    }

    /// PostgreSQL preset; `cdc` selects logical replication (global mode)
    pub fn postgres(cdc: bool) -> Self {
        Self {
            state_mode: if cdc {
                StateMode::Global
            } else {
                StateMode::PerStream
            },
            excluded_namespaces: POSTGRES_EXCLUDED_NAMESPACES
                .iter()
                .map(ToString::to_string)
                .collect(),
            cursor_types: POSTGRES_CURSOR_TYPES
                .iter()
                .map(ToString::to_string)
                .collect(),
            inject_cdc_metadata: true,
        }
    }

    /// Detect PostgreSQL capabilities from a source config
    pub fn from_config(config: &JsonValue) -> Self {
        Self::postgres(is_cdc(config))
    }

    /// Whether the source shares one replication position across all streams
    pub fn supports_global(&self) -> bool {
        self.state_mode == StateMode::Global
    }

    /// Whether a namespace is internal to the database
    pub fn is_excluded_namespace(&self, namespace: Option<&str>) -> bool {
        namespace.is_some_and(|ns| self.excluded_namespaces.contains(ns))
    }

    /// Columns whose type allows them to be used as a cursor
    pub fn cursor_fields(&self, columns: &[ColumnInfo]) -> Vec<String> {
        columns
            .iter()
            .filter(|c| self.cursor_types.contains(&c.data_type.to_uppercase()))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Adjust a discovered catalog to what this source can sync
    ///
    /// Internal namespaces are dropped. In global mode every stream offers both
    /// sync modes, streams without a primary key lose incremental, incremental
    /// streams become source-defined and schemas gain the CDC metadata columns.
    pub fn prepare_catalog(&self, catalog: Catalog) -> Catalog {
        let streams = catalog
            .streams
            .into_iter()
            .filter(|s| !self.is_excluded_namespace(s.namespace.as_deref()))
            .map(|s| {
                if self.supports_global() {
                    prepare_cdc_stream(s, self.inject_cdc_metadata)
                } else {
                    s
                }
            })
            .collect();

        Catalog { streams }
    }

    /// Check a configured catalog and prior state before any phase starts
    pub fn validate(&self, catalog: &ConfiguredCatalog, prior: Option<&SyncState>) -> Result<()> {
        let mut seen = BTreeSet::new();

        for configured in &catalog.streams {
            let id = &configured.stream;

            if !seen.insert(id.clone()) {
                return Err(Error::config(format!(
                    "stream '{id}' appears more than once in the catalog"
                )));
            }

            if self.is_excluded_namespace(id.namespace.as_deref()) {
                return Err(Error::config(format!(
                    "stream '{id}' is in an internal namespace and cannot be synced"
                )));
            }

            if !configured.is_incremental() {
                continue;
            }

            match (self.state_mode, configured.cursor_field()) {
                (StateMode::Global, Some(field)) => {
                    return Err(Error::config(format!(
                        "stream '{id}' uses change data capture; user cursor '{}' is not allowed",
                        field.join(".")
                    )));
                }
                (StateMode::PerStream, None) => {
                    return Err(Error::config(format!(
                        "incremental stream '{id}' needs a cursor_field without change data capture"
                    )));
                }
                _ => {}
            }
        }

        if let Some(state) = prior {
            if state.mode() != self.state_mode {
                return Err(Error::config(format!(
                    "saved state is in {} mode but the source runs in {} mode",
                    state.mode(),
                    self.state_mode
                )));
            }
        }

        Ok(())
    }
}

/// Whether a source config enables logical replication
///
/// Requires `replication_method.replication_slot` and
/// `replication_method.publication` to be set.
pub fn is_cdc(config: &JsonValue) -> bool {
    let method = config.get("replication_method");
    let has = |key: &str| {
        method
            .and_then(|m| m.get(key))
            .is_some_and(|v| !v.is_null())
    };
    let cdc = has("replication_slot") && has("publication");
    tracing::info!("using CDC: {cdc}");
    cdc
}

fn prepare_cdc_stream(stream: CatalogStream, inject_metadata: bool) -> CatalogStream {
    let mut supported_sync_modes = vec![SyncMode::FullRefresh];
    let has_primary_key = !stream.source_defined_primary_key.is_empty();
    if has_primary_key {
        supported_sync_modes.push(SyncMode::Incremental);
    }

    let json_schema = if inject_metadata {
        add_metadata_columns(stream.json_schema)
    } else {
        stream.json_schema
    };

    CatalogStream {
        source_defined_cursor: has_primary_key,
        supported_sync_modes,
        json_schema,
        ..stream
    }
}
