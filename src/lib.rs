// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # Solidafy CDC
//!
//! Snapshot-then-stream change data capture for relational sources.
//!
//! ## Features
//!
//! - **Stream Classification**: decide which streams need a full snapshot from saved state
//! - **Snapshots**: ordered, retrying reads of current table contents, optionally in parallel
//! - **Change Streaming**: replication log replay from a saved position, bounded or unbounded
//! - **Checkpoints**: resumable state emitted only at transaction boundaries
//! - **Per-Stream Cursors**: incremental reads by cursor column for sources without CDC
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use solidafy_cdc::engine::{SyncConfig, SyncOrchestrator};
//! use solidafy_cdc::source::{MemoryChangeLog, MemoryTables};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> solidafy_cdc::Result<()> {
//!     let orchestrator = SyncOrchestrator::new(Arc::new(tables), capabilities)
//!         .with_transport(Arc::new(change_log));
//!
//!     let mut run = orchestrator.run(catalog, prior_state, SyncConfig::default())?;
//!     while let Some(message) = run.next_message().await {
//!         // Persist checkpoints, forward records
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Sync Orchestrator                         │
//! │  run(catalog, state) → Stream<Record | Checkpoint>              │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//! ┌────────────┬─────────────────┴───┬──────────────┬──────────────┐
//! │  Classify  │  Snapshot Producer  │ Change Reader│ State Manager│
//! ├────────────┼─────────────────────┼──────────────┼──────────────┤
//! │ Defer      │ Ordered cursor read │ Resume/skip  │ Position     │
//! │ SnapshotAll│ Parallel workers    │ Target tip   │ Cursors      │
//! │ Per-stream │ Retry, eager close  │ Idle timeout │ Persistence  │
//! └────────────┴─────────────────────┴──────────────┴──────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types
pub mod error;

/// Common types and type aliases
pub mod types;

/// Stream identity, catalogs and source capabilities
pub mod catalog;

/// State management and checkpointing
pub mod state;

/// Stream classification
pub mod classify;

/// Snapshot production
pub mod snapshot;

/// Change-stream reading and CDC metadata
pub mod cdc;

/// Concrete source collaborators (in-memory and DuckDB)
pub mod source;

/// Sync orchestration
pub mod engine;

/// Sync definition files
pub mod config;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};
pub use types::*;

// Re-export commonly used types
pub use catalog::{ConfiguredCatalog, ConfiguredStream, SourceCapabilities, StreamIdentifier};
pub use engine::{Message, SyncConfig, SyncOrchestrator, SyncRun};
pub use state::{ReplicationPosition, SyncState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
