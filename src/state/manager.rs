//! State manager implementation
//!
//! Owns the `SyncState` of one sync run. Mutations go through the manager
//! only, and readers get copies.

use super::types::{CursorValue, ReplicationPosition, StateMode, SyncState};
use crate::catalog::StreamIdentifier;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Exclusive owner of sync progress
///
/// Not thread-safe: the orchestrator serializes every mutation.
#[derive(Debug)]
pub struct StateManager {
    state: SyncState,
    /// Bumped on every effective mutation
    revision: u64,
}

impl StateManager {
    /// Start from a zero-value state for `mode`
    pub fn new(mode: StateMode) -> Self {
        Self {
            state: Self::empty_initial_state(mode),
            revision: 0,
        }
    }

    /// Start from a prior state, or an empty one when there is none
    pub fn from_prior(prior: Option<SyncState>, mode: StateMode) -> Result<Self> {
        let state = match prior {
            Some(state) if state.mode() != mode => {
                return Err(Error::state(format!(
                    "prior state is in {} mode, expected {mode}",
                    state.mode()
                )))
            }
            Some(state) => state,
            None => Self::empty_initial_state(mode),
        };

        Ok(Self { state, revision: 0 })
    }

    /// Zero-value state matching `mode`
    pub fn empty_initial_state(mode: StateMode) -> SyncState {
        SyncState::empty(mode)
    }

    /// Mode of the managed state
    pub fn mode(&self) -> StateMode {
        self.state.mode()
    }

    /// Counter that changes whenever the state does
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Current shared position (global mode)
    pub fn position(&self) -> Option<ReplicationPosition> {
        self.state.shared_position()
    }

    /// Current cursor of a stream (per-stream mode)
    pub fn stream_cursor(&self, stream: &StreamIdentifier) -> Option<&CursorValue> {
        self.state.stream_cursor(stream)
    }

    /// Whether a stream finished its initial snapshot
    pub fn is_stream_synced(&self, stream: &StreamIdentifier) -> bool {
        self.state
            .streams_initial_sync()
            .is_some_and(|synced| synced.contains(stream))
    }

    /// Record that a stream's full contents were emitted (idempotent)
    pub fn mark_stream_snapshot_complete(&mut self, stream: &StreamIdentifier) -> Result<()> {
        let SyncState::Global(cdc) = &self.state else {
            return Err(Error::state(format!(
                "cannot mark '{stream}' snapshot complete in per-stream mode"
            )));
        };

        if !cdc.streams_initial_sync.contains(stream) {
            debug!(%stream, "initial snapshot complete");
            self.state = SyncState::Global(cdc.clone().with_stream_synced(stream.clone()));
            self.revision += 1;
        }
        Ok(())
    }

    /// Move the shared position forward
    ///
    /// Returns whether the position changed. A regression is a no-op.
    pub fn advance_position(&mut self, position: ReplicationPosition) -> bool {
        let SyncState::Global(cdc) = &self.state else {
            warn!(%position, "ignoring replication position in per-stream mode");
            return false;
        };

        if !cdc.accepts(position) {
            debug!(
                %position,
                current = ?cdc.shared_position,
                "ignoring replication position regression"
            );
            return false;
        }

        self.state = SyncState::Global(cdc.clone().with_position(position));
        self.revision += 1;
        true
    }

    /// Move a stream's cursor forward
    ///
    /// Returns whether the cursor changed. Lower or equal values are ignored.
    pub fn advance_stream_cursor(
        &mut self,
        stream: &StreamIdentifier,
        cursor: CursorValue,
    ) -> bool {
        let SyncState::PerStream(per_stream) = &mut self.state else {
            warn!(%stream, "ignoring stream cursor in global mode");
            return false;
        };

        let current = per_stream.streams.remove(stream).unwrap_or_default();
        if !current.accepts(&cursor) {
            debug!(%stream, %cursor, "ignoring cursor regression");
            per_stream.streams.insert(stream.clone(), current);
            return false;
        }

        per_stream
            .streams
            .insert(stream.clone(), current.with_cursor(cursor));
        self.revision += 1;
        true
    }

    /// Forget the initial sync of every stream outside `tracked` (global mode)
    ///
    /// Changes of untracked streams are skipped, so they must be snapshotted
    /// again once tracked. Returns the forgotten streams.
    pub fn retain_synced(
        &mut self,
        tracked: &BTreeSet<StreamIdentifier>,
    ) -> Vec<StreamIdentifier> {
        let SyncState::Global(cdc) = &self.state else {
            return Vec::new();
        };

        let dropped: Vec<StreamIdentifier> = cdc
            .streams_initial_sync
            .difference(tracked)
            .cloned()
            .collect();
        if !dropped.is_empty() {
            self.state = SyncState::Global(cdc.clone().with_synced_within(tracked));
            self.revision += 1;
        }
        dropped
    }

    /// Immutable copy of the current state for checkpointing
    pub fn snapshot(&self) -> SyncState {
        self.state.clone()
    }
}
