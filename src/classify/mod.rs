//! Stream classification
//!
//! Decides which streams need a full snapshot before change streaming
//! (or before the next cursor read in per-stream mode) can cover them.
//!
//! # Overview
//!
//! The classify module provides:
//! - `classify` - pure function from (streams, prior state) to the snapshot set
//! - `InitialSnapshotPolicy` - behaviour on the very first global-mode run

use crate::catalog::StreamIdentifier;
use crate::state::SyncState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What to snapshot when a global-mode sync has never run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialSnapshotPolicy {
    /// Start streaming from the current log tip and leave snapshots to a later run
    #[default]
    Defer,
    /// Snapshot every stream before the first streaming phase
    SnapshotAll,
}

/// Streams from `all` that need a snapshot given `prior`
///
/// Global mode: an absent or empty prior state yields nothing under
/// [`InitialSnapshotPolicy::Defer`] and everything under
/// [`InitialSnapshotPolicy::SnapshotAll`]; otherwise the result is `all`
/// minus `streams_initial_sync`.
///
/// Per-stream mode: streams without a stored cursor.
pub fn classify(
    all: &BTreeSet<StreamIdentifier>,
    prior: Option<&SyncState>,
    policy: InitialSnapshotPolicy,
) -> BTreeSet<StreamIdentifier> {
    match prior {
        None => first_run(all, policy),
        Some(SyncState::Global(cdc)) if cdc.is_empty() => first_run(all, policy),
        Some(SyncState::Global(cdc)) => {
            all.difference(&cdc.streams_initial_sync).cloned().collect()
        }
        Some(state @ SyncState::PerStream(_)) => all
            .iter()
            .filter(|id| state.stream_cursor(id).is_none())
            .cloned()
            .collect(),
    }
}

fn first_run(
    all: &BTreeSet<StreamIdentifier>,
    policy: InitialSnapshotPolicy,
) -> BTreeSet<StreamIdentifier> {
    match policy {
        InitialSnapshotPolicy::Defer => BTreeSet::new(),
        InitialSnapshotPolicy::SnapshotAll => all.clone(),
    }
}
