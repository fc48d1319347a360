//! Catalog module
//!
//! Stream identity, configured catalogs and the source capability descriptor.
//!
//! # Overview
//!
//! The catalog module provides:
//! - `StreamIdentifier` - (namespace, name) key of a stream
//! - `ConfiguredCatalog` / `ConfiguredStream` - what to sync and how
//! - `SourceCapabilities` - state mode, internal namespaces, cursor types

mod capabilities;
mod types;

pub use capabilities::{is_cdc, ColumnInfo, SourceCapabilities};
pub use types::{
    Catalog, CatalogStream, ConfiguredCatalog, ConfiguredStream, ConfiguredSyncMode, CursorSpec,
    StreamIdentifier, SyncMode,
};

#[cfg(test)]
mod tests;
