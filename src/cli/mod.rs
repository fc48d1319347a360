//! CLI module
//!
//! Command-line interface for running syncs.
//!
//! # Commands
//!
//! - `validate` - Check the sync definition against the saved state
//! - `discover` - List streams of a database source
//! - `classify` - Show which streams the next run snapshots
//! - `read` - Snapshot, then stream changes, persisting checkpoints
//! - `state` - Show or reset the saved state

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat};
pub use runner::Runner;
