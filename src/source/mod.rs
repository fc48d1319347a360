//! Source collaborators
//!
//! Concrete implementations of the snapshot query and change transport
//! collaborators.
//!
//! # Overview
//!
//! The source module provides:
//! - `DuckDbSource` - snapshot reads and discovery over an attached database
//! - `MemoryTables` / `MemoryChangeLog` - in-memory (or JSON Lines backed) source
//! - `ResourceLog` - ordered record of resource acquisition and release

mod database;
mod memory;

pub use database::{DatabaseKind, DuckDbSource};
pub use memory::{
    FailureKind, MemoryChangeLog, MemoryTables, ResourceEvent, ResourceLog,
};
