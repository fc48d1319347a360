//! State management module
//!
//! Handles replication positions, stream cursors and checkpointing.
//! State is persisted between sync runs to enable resumable syncs.
//!
//! # Overview
//!
//! The state module provides:
//! - `SyncState` - global (`CdcState`) or per-stream progress
//! - `StateManager` - single owner of progress during a run
//! - `StateStore` - file-based persistence of the latest checkpoint

mod manager;
mod store;
mod types;

pub use manager::StateManager;
pub use store::StateStore;
pub use types::{
    CdcState, CursorValue, PerStreamState, ReplicationPosition, StateMode, StreamState, SyncState,
};

#[cfg(test)]
mod manager_tests;
